use codec::{Decode, Encode};
use scale_info::TypeInfo;

use crate::types::TickNumber;
use crate::{file_system, payment_streams, proofs_dealer, providers};

/// Everything the core reports to the outside world (indexers, providers' nodes, fishermen).
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub enum Event {
    Providers(providers::Event),
    FileSystem(file_system::Event),
    ProofsDealer(proofs_dealer::Event),
    PaymentStreams(payment_streams::Event),
}

impl From<providers::Event> for Event {
    fn from(event: providers::Event) -> Self {
        Event::Providers(event)
    }
}

impl From<file_system::Event> for Event {
    fn from(event: file_system::Event) -> Self {
        Event::FileSystem(event)
    }
}

impl From<proofs_dealer::Event> for Event {
    fn from(event: proofs_dealer::Event) -> Self {
        Event::ProofsDealer(event)
    }
}

impl From<payment_streams::Event> for Event {
    fn from(event: payment_streams::Event) -> Self {
        Event::PaymentStreams(event)
    }
}

/// An event together with the tick in which it was deposited.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, TypeInfo)]
pub struct EventRecord {
    pub tick: TickNumber,
    pub event: Event,
}
