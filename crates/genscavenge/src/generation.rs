//! Young and old generations.

use crate::chunk::ChunkRef;
use crate::space::{Space, SpaceId};

/// Eden plus survivor from/to pairs.
#[derive(Debug)]
pub struct YoungGeneration {
    /// Mutator allocation space
    pub eden: Space,
    survivor_from: Vec<Space>,
    survivor_to: Vec<Space>,
}

impl YoungGeneration {
    fn new(survivor_spaces: usize) -> Self {
        Self {
            eden: Space::new(SpaceId::Eden),
            survivor_from: (0..survivor_spaces)
                .map(|age| Space::new(SpaceId::SurvivorFrom(age as u8)))
                .collect(),
            survivor_to: (0..survivor_spaces)
                .map(|age| Space::new(SpaceId::SurvivorTo(age as u8)))
                .collect(),
        }
    }

    /// Number of survivor pairs.
    pub fn survivor_count(&self) -> usize {
        self.survivor_from.len()
    }

    /// Every young space.
    pub fn spaces(&self) -> impl Iterator<Item = &Space> {
        std::iter::once(&self.eden)
            .chain(self.survivor_from.iter())
            .chain(self.survivor_to.iter())
    }

    /// Chunk bytes of all young spaces.
    pub fn chunk_bytes(&self) -> usize {
        self.spaces().map(Space::chunk_bytes).sum()
    }
}

/// Old generation from/to pair.
#[derive(Debug)]
pub struct OldGeneration {
    /// Active space
    pub from: Space,
    /// Copy destination while a cycle runs
    pub to: Space,
}

impl OldGeneration {
    fn new() -> Self {
        Self {
            from: Space::new(SpaceId::OldFrom),
            to: Space::new(SpaceId::OldTo),
        }
    }

    /// Chunk bytes of both spaces.
    pub fn chunk_bytes(&self) -> usize {
        self.from.chunk_bytes() + self.to.chunk_bytes()
    }
}

/// All spaces of a heap.
#[derive(Debug)]
pub struct Generations {
    /// Young generation
    pub young: YoungGeneration,
    /// Old generation
    pub old: OldGeneration,
}

impl Generations {
    /// Empty generations with `survivor_spaces` survivor pairs.
    pub fn new(survivor_spaces: usize) -> Self {
        Self {
            young: YoungGeneration::new(survivor_spaces),
            old: OldGeneration::new(),
        }
    }

    /// The space with identity `id`.
    ///
    /// # Panics
    /// If `id` names a survivor age beyond the configured count.
    pub fn space(&self, id: SpaceId) -> &Space {
        match id {
            SpaceId::Eden => &self.young.eden,
            SpaceId::SurvivorFrom(age) => &self.young.survivor_from[age as usize],
            SpaceId::SurvivorTo(age) => &self.young.survivor_to[age as usize],
            SpaceId::OldFrom => &self.old.from,
            SpaceId::OldTo => &self.old.to,
        }
    }

    /// Mutable access to the space with identity `id`.
    ///
    /// # Panics
    /// If `id` names a survivor age beyond the configured count.
    pub fn space_mut(&mut self, id: SpaceId) -> &mut Space {
        match id {
            SpaceId::Eden => &mut self.young.eden,
            SpaceId::SurvivorFrom(age) => &mut self.young.survivor_from[age as usize],
            SpaceId::SurvivorTo(age) => &mut self.young.survivor_to[age as usize],
            SpaceId::OldFrom => &mut self.old.from,
            SpaceId::OldTo => &mut self.old.to,
        }
    }

    /// Whether `id` names a space of this heap.
    pub fn has_space(&self, id: SpaceId) -> bool {
        match id {
            SpaceId::SurvivorFrom(age) | SpaceId::SurvivorTo(age) => {
                (age as usize) < self.young.survivor_count()
            }
            _ => true,
        }
    }

    /// Every space, young first.
    pub fn spaces(&self) -> impl Iterator<Item = &Space> {
        self.young
            .spaces()
            .chain([&self.old.from, &self.old.to])
    }

    /// Move survivor and old to-spaces into their from-spaces.
    pub fn absorb_to_spaces(&mut self) {
        let young = &mut self.young;
        for (from, to) in young.survivor_from.iter_mut().zip(young.survivor_to.iter_mut()) {
            from.absorb(to);
        }
        self.old.from.absorb(&mut self.old.to);
    }

    /// Chunk bytes owned by all spaces.
    pub fn chunk_bytes(&self) -> usize {
        self.young.chunk_bytes() + self.old.chunk_bytes()
    }

    /// Detach every chunk of every space.
    pub fn take_all_chunks(&mut self) -> Vec<ChunkRef> {
        let ids: Vec<SpaceId> = self.spaces().map(Space::id).collect();
        ids.into_iter()
            .flat_map(|id| self.space_mut(id).take_chunks())
            .collect()
    }
}
