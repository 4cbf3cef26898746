//! Idempotent reconciliation of external thread history into the mirror.

pub mod merger;

pub use merger::{
    MIRROR_ALT, MirrorState, ensure_state, merge_history, plan_batch, search_key_for,
};
