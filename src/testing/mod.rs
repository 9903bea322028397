//! Hierarchical test engine
//!
//! Test catalogs are declared as a tree of groups and tests with scoped
//! lifecycle hooks, and executed by a [`Runner`] that reports progress as
//! [`RunEvent`]s. Test bodies talk to their own result through a
//! [`TestApi`].

mod context;
mod events;
mod runner;
mod status;
mod tree;

pub use context::{
    mask_authorization, Decoration, TestApi, TestError, TestRecord, MASKED_TOKEN,
    NOT_IMPLEMENTED_MESSAGE, NOT_SUPPORTED_MESSAGE,
};
pub use events::{NodeSnapshot, RunEvent};
pub use runner::{CancelHandle, RunReport, RunState, Runner};
pub use status::Status;
pub use tree::{
    child_path, BoxFuture, CatalogEntry, Group, GroupBuilder, HookFn, HookKind, Hooks, Located,
    Node, Test, TestFn, TestTree, ROOT_NAME,
};
