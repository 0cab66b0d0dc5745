mod error;
mod heap;
mod system;

pub mod bitmap;
pub mod free_list;
pub mod mark;
pub mod memory;
pub mod object;
pub mod roots;
pub mod safepoint;
pub mod simple;
pub mod sweep;
pub mod tlab;

pub use error::HeapError;
pub use heap::*;
pub use memory::{Address, WORD_SIZE};
pub use object::{NarrowEncoding, ObjectModel, Slot};
pub use roots::{HandleTable, RootEnumerator, RootKind, RootProvider};
pub use system::{OS_PAGE_SIZE, page_size};
