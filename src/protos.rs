//! Wire protocols spoken by the relay node.

pub mod stun;
