//! Voice bundles derived from recordings.
//!
//! [`VoiceCloner`] turns a reference clip plus its transcript into a reusable
//! bundle. [`VoiceSwapper`] re-voices a clip with another speaker's bundle.

mod cloner;
mod swapper;

pub use cloner::VoiceCloner;
pub use swapper::{ContentTokenizer, SwapCandidate, VoiceSwapper};
