#![cfg_attr(not(feature = "std"), no_std)]

use sp_core::Hasher;
use sp_runtime::traits::BlakeTwo256;

/// Length in bytes of every hash in the protocol (file keys, fingerprints, roots, ids).
pub const H_LENGTH: usize = BlakeTwo256::LENGTH;

/// Size in bytes of the chunks a file is split into before merklisation.
pub const FILE_CHUNK_SIZE: u64 = 2u64.pow(10);

/// Amount of file data covered by a single chunk challenge: one challenge per started MiB.
pub const FILE_SIZE_TO_CHALLENGES: u64 = 2u64.pow(20);

/// Number of bytes in a "giga unit" of data, the unit prices are quoted in.
pub const GIGAUNIT: u64 = 2u64.pow(30);
