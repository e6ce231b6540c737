pub mod id;
pub mod wire;

pub use wire::{Body, Envelope, MessageKind, VoteChoice};
