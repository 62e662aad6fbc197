use shp_file_metadata::Leaf;
use sp_core::H256;
use sp_trie::CompactProof;

/// What the forest responded with for a single challenged key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Proven<K, D> {
    /// The forest has no leaves.
    Empty,
    ExactKey(Leaf<K, D>),
    /// The leaves right before and after the challenged key. At least one is `Some`.
    NeighbourKeys((Option<Leaf<K, D>>, Option<Leaf<K, D>>)),
}

impl<K, D> Proven<K, D> {
    pub fn new_exact_key(key: K, data: D) -> Self {
        Proven::ExactKey(Leaf::new(key, data))
    }

    pub fn new_neighbour_keys(
        left: Option<Leaf<K, D>>,
        right: Option<Leaf<K, D>>,
    ) -> Result<Self, &'static str> {
        match (left, right) {
            (None, None) => Err("Both left and right leaves cannot be None"),
            (left, right) => Ok(Proven::NeighbourKeys((left, right))),
        }
    }
}

/// A proof of the response to a set of challenges, built against `root`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForestProof<K, D> {
    pub proven: Vec<Proven<K, D>>,
    pub proof: CompactProof,
    pub root: H256,
}
