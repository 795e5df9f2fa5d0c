//! KPN: a knowledge- and persona-aware response ranking network on candle.
//!
//! [`Kpn`] scores a candidate response against its conversation context,
//! a set of knowledge snippets and a conversation goal, and reports how
//! relevant each snippet was judged to be.

pub mod config;
pub mod error;
pub mod init;
pub mod model;
pub mod tensor_ext;

pub use crate::{
    config::{KpnConfig, Preset, Settings},
    error::{KpnError, Result},
    model::{Batch, BranchScores, Kpn, KpnOutput},
};
