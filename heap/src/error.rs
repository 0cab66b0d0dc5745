use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HeapError {
    #[error("invalid heap settings: {0}")]
    InvalidSettings(&'static str),

    #[error("could not reserve {size} bytes of address space")]
    Reserve {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("could not commit {size} bytes for {what}")]
    Commit {
        what: &'static str,
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("out of memory: no free chunk of {requested_words} words after collection")]
    OutOfMemory { requested_words: usize },

    #[error("collection cycle aborted: {0}")]
    CycleAborted(&'static str),
}

impl HeapError {
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, HeapError::OutOfMemory { .. })
    }
}
