use sp_core::H256;
use trie_db::CError;

pub(crate) type ErrorT<T> = Error<H256, CError<T>>;

type BoxTrieError<H, CodecError> = Box<trie_db::TrieError<H, CodecError>>;

#[derive(thiserror::Error, Debug)]
pub enum Error<H, CodecError> {
    #[error("Forest storage error: {0}")]
    ForestStorage(ForestStorageError),
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error(transparent)]
    TrieError(BoxTrieError<H, CodecError>),
}

impl<H, CodecError> From<BoxTrieError<H, CodecError>> for Error<H, CodecError> {
    fn from(x: BoxTrieError<H, CodecError>) -> Self {
        Error::TrieError(x)
    }
}

impl<H, CodecError> From<ForestStorageError> for Error<H, CodecError> {
    fn from(x: ForestStorageError) -> Self {
        Error::ForestStorage(x)
    }
}

/// Error type for the forest storage implementations.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ForestStorageError {
    #[error("Failed to create trie iterator")]
    FailedToCreateTrieIterator,
    #[error("Failed to parse key")]
    FailedToParseKey,
    #[error("Failed to decode file metadata of leaf ({0:x?})")]
    FailedToDecodeValue(H256),
    #[error("Failed to generate compact proof")]
    FailedToGenerateCompactProof,
    #[error("File key already in the forest: ({0:x?})")]
    FileKeyAlreadyExists(H256),
    #[error("File key not in the forest: ({0:x?})")]
    FileKeyNotFound(H256),
    #[error("Failed to construct proven leaves")]
    FailedToConstructProvenLeaves,
}
