#[doc(inline)]
pub use avl_tree::{self, *};
