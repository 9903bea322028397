//! Test tree model
//!
//! A catalog is a tree of groups and tests. Every node is addressed by a
//! dot-separated path of child indexes from the root: the third child of
//! the second top-level group is `"1.2"`, the root itself is `""`.
//!
//! Trees are declared through a [`GroupBuilder`] handle. Nesting a group
//! hands a new builder for that group to the closure, so the active scope
//! follows ordinary call nesting.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::common::{Result, Settings};

use super::context::TestApi;

/// Name of the implicit root group
pub const ROOT_NAME: &str = "All Tests";

pub use futures_util::future::BoxFuture;

/// A lifecycle hook
pub type HookFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A test body. Receives the run settings and the test's context API.
pub type TestFn = Arc<dyn Fn(Arc<Settings>, TestApi) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Which lifecycle hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Once before the group's children
    Before,
    /// Once after the group's children
    After,
    /// Before every test directly inside the group
    BeforeEach,
    /// After every test directly inside the group
    AfterEach,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HookKind::Before => "before",
            HookKind::After => "after",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
        })
    }
}

/// Hooks registered on a group
#[derive(Clone, Default)]
pub struct Hooks {
    before: Option<HookFn>,
    after: Option<HookFn>,
    before_each: Option<HookFn>,
    after_each: Option<HookFn>,
}

impl Hooks {
    pub fn get(&self, kind: HookKind) -> Option<&HookFn> {
        match kind {
            HookKind::Before => self.before.as_ref(),
            HookKind::After => self.after.as_ref(),
            HookKind::BeforeEach => self.before_each.as_ref(),
            HookKind::AfterEach => self.after_each.as_ref(),
        }
    }

    fn set(&mut self, kind: HookKind, hook: HookFn) {
        let slot = match kind {
            HookKind::Before => &mut self.before,
            HookKind::After => &mut self.after,
            HookKind::BeforeEach => &mut self.before_each,
            HookKind::AfterEach => &mut self.after_each,
        };
        *slot = Some(hook);
    }
}

/// A node of the test tree
pub enum Node {
    Group(Group),
    Test(Test),
}

/// A named collection of tests and nested groups
pub struct Group {
    pub name: String,
    pub path: String,
    pub children: Vec<Node>,
    pub hooks: Hooks,
}

/// A single executable check
pub struct Test {
    pub name: String,
    pub path: String,
    pub body: Option<TestFn>,
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Group(group) => &group.name,
            Node::Test(test) => &test.name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Node::Group(group) => &group.path,
            Node::Test(test) => &test.path,
        }
    }

    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Node::Group(group) => Some(group),
            Node::Test(_) => None,
        }
    }

    pub fn as_test(&self) -> Option<&Test> {
        match self {
            Node::Group(_) => None,
            Node::Test(test) => Some(test),
        }
    }

    /// Hierarchy-only projection of this node
    pub fn catalog(&self) -> CatalogEntry {
        match self {
            Node::Group(group) => CatalogEntry {
                name: group.name.clone(),
                children: Some(group.children.iter().map(Node::catalog).collect()),
            },
            Node::Test(test) => CatalogEntry {
                name: test.name.clone(),
                children: None,
            },
        }
    }

    /// Number of tests in this subtree
    pub fn test_count(&self) -> usize {
        match self {
            Node::Group(group) => group.children.iter().map(Node::test_count).sum(),
            Node::Test(_) => 1,
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Node::Group(group) => f
                .debug_struct("Group")
                .field("name", &group.name)
                .field("path", &group.path)
                .field("children", &group.children)
                .finish(),
            Node::Test(test) => f
                .debug_struct("Test")
                .field("name", &test.name)
                .field("path", &test.path)
                .field("implemented", &test.body.is_some())
                .finish(),
        }
    }
}

/// Serialized catalog entry: `{name, children?}`
///
/// Never carries execution state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<CatalogEntry>>,
}

/// A located node together with the group that directly contains it
pub struct Located<'a> {
    pub node: &'a Node,
    /// `None` for the root
    pub parent: Option<&'a Group>,
}

/// A fully declared test tree
#[derive(Debug)]
pub struct TestTree {
    root: Node,
}

impl TestTree {
    /// Declare a tree. The closure receives a builder for the root group.
    pub fn build(declare: impl FnOnce(&mut GroupBuilder<'_>)) -> Self {
        let mut root = Group {
            name: ROOT_NAME.to_string(),
            path: String::new(),
            children: Vec::new(),
            hooks: Hooks::default(),
        };
        declare(&mut GroupBuilder { group: &mut root });
        Self {
            root: Node::Group(root),
        }
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Find the node at `path` and its enclosing group
    pub fn locate(&self, path: &str) -> Option<Located<'_>> {
        let mut located = Located {
            node: &self.root,
            parent: None,
        };
        if path.is_empty() {
            return Some(located);
        }
        for segment in path.split('.') {
            let index: usize = segment.parse().ok()?;
            let group = located.node.as_group()?;
            located = Located {
                node: group.children.get(index)?,
                parent: Some(group),
            };
        }
        Some(located)
    }

    /// Find the node at `path`
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        self.locate(path).map(|located| located.node)
    }

    /// Hierarchy-only projection of the whole tree
    pub fn catalog(&self) -> CatalogEntry {
        self.root.catalog()
    }
}

/// Path of the `index`-th child of the node at `parent`
pub fn child_path(parent: &str, index: usize) -> String {
    if parent.is_empty() {
        index.to_string()
    } else {
        format!("{}.{}", parent, index)
    }
}

/// Handle used to declare the contents of one group
pub struct GroupBuilder<'a> {
    group: &'a mut Group,
}

impl GroupBuilder<'_> {
    /// Path of the group being declared
    pub fn path(&self) -> &str {
        &self.group.path
    }

    fn next_path(&self) -> String {
        child_path(&self.group.path, self.group.children.len())
    }

    /// Append a nested group and declare its contents
    pub fn group(&mut self, name: impl Into<String>, declare: impl FnOnce(&mut GroupBuilder<'_>)) -> &mut Self {
        let mut group = Group {
            name: name.into(),
            path: self.next_path(),
            children: Vec::new(),
            hooks: Hooks::default(),
        };
        declare(&mut GroupBuilder { group: &mut group });
        self.group.children.push(Node::Group(group));
        self
    }

    /// Append a test with a body
    pub fn test<F, Fut>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(Arc<Settings>, TestApi) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let body: TestFn = Arc::new(move |settings: Arc<Settings>, api: TestApi| {
            Box::pin(body(settings, api)) as BoxFuture<'static, Result<()>>
        });
        self.push_test(name.into(), Some(body));
        self
    }

    /// Append a placeholder test without a body
    pub fn pending(&mut self, name: impl Into<String>) -> &mut Self {
        self.push_test(name.into(), None);
        self
    }

    fn push_test(&mut self, name: String, body: Option<TestFn>) {
        let path = self.next_path();
        self.group.children.push(Node::Test(Test { name, path, body }));
    }

    pub fn before<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hook(HookKind::Before, hook)
    }

    pub fn after<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hook(HookKind::After, hook)
    }

    pub fn before_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hook(HookKind::BeforeEach, hook)
    }

    pub fn after_each<F, Fut>(&mut self, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.hook(HookKind::AfterEach, hook)
    }

    /// Register a hook on this group, replacing an earlier one of the same kind
    pub fn hook<F, Fut>(&mut self, kind: HookKind, hook: F) -> &mut Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let hook: HookFn = Arc::new(move || Box::pin(hook()) as BoxFuture<'static, Result<()>>);
        self.group.hooks.set(kind, hook);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> TestTree {
        TestTree::build(|root| {
            root.group("Kick-off", |g| {
                g.test("accepts", |_, _| async { Ok(()) });
                g.group("Headers", |g| {
                    g.pending("accept");
                    g.pending("prefer");
                });
            });
            root.test("top-level", |_, _| async { Ok(()) });
            root.group("Empty", |_| {});
        })
    }

    /// Walk the catalog and collect (path, name) pairs
    fn catalog_paths(entry: &CatalogEntry, path: &str, out: &mut Vec<(String, String)>) {
        out.push((path.to_string(), entry.name.clone()));
        for (index, child) in entry.children.iter().flatten().enumerate() {
            catalog_paths(child, &child_path(path, index), out);
        }
    }

    #[test]
    fn test_paths_are_child_ordinals() {
        let tree = sample_tree();
        assert_eq!(tree.lookup("0").unwrap().name(), "Kick-off");
        assert_eq!(tree.lookup("0.0").unwrap().path(), "0.0");
        assert_eq!(tree.lookup("0.1.1").unwrap().name(), "prefer");
        assert_eq!(tree.lookup("0.1.1").unwrap().path(), "0.1.1");
        assert_eq!(tree.lookup("1").unwrap().path(), "1");
        assert_eq!(tree.lookup("").unwrap().name(), ROOT_NAME);
    }

    #[test]
    fn test_child_path_property() {
        fn check(node: &Node) {
            if let Node::Group(group) = node {
                for (k, child) in group.children.iter().enumerate() {
                    assert_eq!(child.path(), child_path(&group.path, k));
                    check(child);
                }
            }
        }
        check(sample_tree().root());
    }

    #[test]
    fn test_lookup_out_of_range() {
        let tree = sample_tree();
        assert!(tree.lookup("7").is_none());
        assert!(tree.lookup("0.5").is_none());
        assert!(tree.lookup("1.0").is_none(), "tests have no children");
        assert!(tree.lookup("0.x").is_none());
        assert!(tree.lookup("0..1").is_none());
    }

    #[test]
    fn test_locate_returns_enclosing_group() {
        let tree = sample_tree();
        let located = tree.locate("0.1.0").unwrap();
        assert_eq!(located.parent.unwrap().name, "Headers");
        assert!(tree.locate("").unwrap().parent.is_none());
    }

    #[test]
    fn test_every_catalog_path_resolves_to_its_node() {
        let tree = sample_tree();
        let mut paths = Vec::new();
        catalog_paths(&tree.catalog(), "", &mut paths);
        assert_eq!(paths.len(), 8);
        for (path, name) in paths {
            let node = tree.lookup(&path).unwrap();
            assert_eq!(node.path(), path);
            assert_eq!(node.name(), name);
        }
    }

    #[test]
    fn test_catalog_json_shape() {
        let tree = TestTree::build(|root| {
            root.group("G", |g| {
                g.pending("t");
            });
        });
        let json = serde_json::to_value(tree.catalog()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": ROOT_NAME,
                "children": [{ "name": "G", "children": [{ "name": "t" }] }]
            })
        );
    }

    #[test]
    fn test_test_count() {
        assert_eq!(sample_tree().root().test_count(), 4);
    }

    #[test]
    fn test_hook_registration_replaces() {
        let tree = TestTree::build(|root| {
            root.before(|| async { Err(crate::Error::Internal("first".into())) });
            root.before(|| async { Ok(()) });
        });
        let group = tree.root().as_group().unwrap();
        assert!(group.hooks.get(HookKind::Before).is_some());
        assert!(group.hooks.get(HookKind::After).is_none());
    }
}
