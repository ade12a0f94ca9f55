//! Boefje and Normalizer execution.

mod boefje;
mod normalizer;

pub use boefje::{BoefjeBackend, BoefjeRunner, CommandBackend, InProcessBackend};
pub use normalizer::NormalizerRunner;
