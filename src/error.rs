use std::fmt;

use thiserror::Error;

use crate::descriptor::DescriptorError;
use crate::header::HeaderError;
use crate::image::ComposeError;
use crate::transfer::TransferError;

/// The pipeline stage an error originated from
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Stage {
    Descriptor,
    Compose,
    Header,
    Transfer,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Descriptor => "descriptor",
            Stage::Compose => "compose",
            Stage::Header => "header",
            Stage::Transfer => "transfer",
        };

        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid board descriptor: {}", _0)]
    Descriptor(#[from] DescriptorError),
    #[error("Could not compose image: {}", _0)]
    Compose(#[from] ComposeError),
    #[error("Could not write header: {}", _0)]
    Header(#[from] HeaderError),
    #[error("Could not deliver image: {}", _0)]
    Transfer(#[from] TransferError),
}

impl Error {
    /// Returns the stage that failed
    pub fn stage(&self) -> Stage {
        match self {
            Error::Descriptor(_) => Stage::Descriptor,
            Error::Compose(_) => Stage::Compose,
            Error::Header(_) => Stage::Header,
            Error::Transfer(_) => Stage::Transfer,
        }
    }
}
