//! Directory storage and the projected tree
//!
//! `DirectoryStorage` is the only mutable state: directory URL -> immediate
//! children as last listed. The nested [`Node`] tree handed to subscribers is
//! rebuilt from it on demand and has no state of its own.

use std::collections::HashMap;

use serde::Serialize;

/// One entry of the projected tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub name: String,
    pub url: String,
    pub is_directory: bool,
    /// `None` for files; `Some` (possibly empty) for directories
    pub children: Option<Vec<Node>>,
    pub is_transferring: bool,
    /// `false` for a directory whose listing has not been stored yet
    pub is_loaded: bool,
}

impl Node {
    pub fn file(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            is_directory: false,
            children: None,
            is_transferring: false,
            is_loaded: true,
        }
    }

    /// A directory entry as it appears in a listing (children unknown)
    pub fn directory(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            is_directory: true,
            children: Some(Vec::new()),
            is_transferring: false,
            is_loaded: false,
        }
    }

    /// Find a node by URL anywhere below (and including) this one
    pub fn find(&self, url: &str) -> Option<&Node> {
        if self.url == url {
            return Some(self);
        }
        self.children
            .as_ref()?
            .iter()
            .find_map(|child| child.find(url))
    }
}

fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
            .then_with(|| a.name.cmp(&b.name))
    });
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct DirectoryStorage {
    entries: HashMap<String, Vec<Node>>,
}

impl DirectoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a directory's listing with a fresh one.
    ///
    /// A URL listed twice keeps its last occurrence.
    pub fn load(&mut self, directory: &str, children: Vec<Node>) {
        let mut by_url: HashMap<String, Node> = HashMap::with_capacity(children.len());
        for node in children {
            by_url.insert(node.url.clone(), node);
        }
        let mut children: Vec<Node> = by_url.into_values().collect();
        sort_nodes(&mut children);
        self.entries.insert(directory.to_string(), children);
    }

    pub fn is_loaded(&self, directory: &str) -> bool {
        self.entries.contains_key(directory)
    }

    pub fn children(&self, directory: &str) -> Option<&[Node]> {
        self.entries.get(directory).map(Vec::as_slice)
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drop a directory's listing so it reads as unloaded again
    pub fn unload(&mut self, directory: &str) {
        self.entries.remove(directory);
    }

    /// Patch a node into its parent's listing.
    ///
    /// An existing entry with the same URL is replaced. Returns `false` when
    /// the parent has not been loaded; inserting there would fake a listing.
    pub fn insert(&mut self, parent: &str, node: Node) -> bool {
        let Some(children) = self.entries.get_mut(parent) else {
            return false;
        };
        children.retain(|existing| existing.url != node.url);
        children.push(node);
        sort_nodes(children);
        true
    }

    /// Remove a node from its parent's listing, along with any stored
    /// listings at or below it. Returns whether anything changed.
    ///
    /// `url` may name a directory with or without its trailing slash.
    pub fn remove(&mut self, parent: &str, url: &str) -> bool {
        let as_file = url.trim_end_matches('/');
        let as_directory = format!("{}/", as_file);

        let mut changed = false;
        if let Some(children) = self.entries.get_mut(parent) {
            let before = children.len();
            children.retain(|existing| existing.url != as_file && existing.url != as_directory);
            changed = children.len() != before;
        }

        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&as_directory));
        changed |= self.entries.len() != before;
        changed
    }

    /// Recursively assemble the tree under `root_url`
    pub fn build_tree(&self, root_name: &str, root_url: &str) -> Node {
        let mut root = Node::directory(root_name, root_url);
        self.fill(&mut root);
        root
    }

    fn fill(&self, node: &mut Node) {
        if !node.is_directory {
            return;
        }
        match self.entries.get(&node.url) {
            Some(children) => {
                let mut built = children.clone();
                for child in &mut built {
                    self.fill(child);
                }
                node.children = Some(built);
                node.is_loaded = true;
            }
            None => {
                node.children = Some(Vec::new());
                node.is_loaded = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "sftp://h:22/home/";

    fn listing() -> Vec<Node> {
        vec![
            Node::file("readme.md", "sftp://h:22/home/readme.md"),
            Node::directory("src", "sftp://h:22/home/src/"),
            Node::directory("Assets", "sftp://h:22/home/Assets/"),
            Node::file("b.txt", "sftp://h:22/home/b.txt"),
        ]
    }

    #[test]
    fn test_children_match_last_listing() {
        let mut storage = DirectoryStorage::new();
        storage.load(ROOT, listing());
        storage.load(
            "sftp://h:22/home/src/",
            vec![Node::file("old.rs", "sftp://h:22/home/src/old.rs")],
        );
        // Later listing replaces the earlier one entirely
        storage.load(
            "sftp://h:22/home/src/",
            vec![Node::file("main.rs", "sftp://h:22/home/src/main.rs")],
        );

        let tree = storage.build_tree("home", ROOT);
        assert!(tree.is_loaded);
        let names: Vec<_> = tree
            .children
            .as_ref()
            .unwrap()
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(names, ["Assets", "src", "b.txt", "readme.md"]);

        let src = tree.find("sftp://h:22/home/src/").unwrap();
        assert!(src.is_loaded);
        assert_eq!(src.children.as_ref().unwrap().len(), 1);
        assert_eq!(src.children.as_ref().unwrap()[0].name, "main.rs");

        let file = tree.find("sftp://h:22/home/b.txt").unwrap();
        assert_eq!(file.children, None);
    }

    #[test]
    fn test_unloaded_distinct_from_empty() {
        let mut storage = DirectoryStorage::new();
        storage.load(ROOT, listing());
        storage.load("sftp://h:22/home/src/", Vec::new());

        let tree = storage.build_tree("home", ROOT);
        let empty = tree.find("sftp://h:22/home/src/").unwrap();
        let unloaded = tree.find("sftp://h:22/home/Assets/").unwrap();

        assert_eq!(empty.children, Some(vec![]));
        assert_eq!(unloaded.children, Some(vec![]));
        assert!(empty.is_loaded);
        assert!(!unloaded.is_loaded);
    }

    #[test]
    fn test_insert_replaces_duplicates() {
        let mut storage = DirectoryStorage::new();
        storage.load(ROOT, listing());

        let mut updated = Node::file("b.txt", "sftp://h:22/home/b.txt");
        updated.is_transferring = true;
        assert!(storage.insert(ROOT, updated.clone()));
        assert!(storage.insert(ROOT, updated));

        let children = storage.children(ROOT).unwrap();
        let matches: Vec<_> = children
            .iter()
            .filter(|n| n.url == "sftp://h:22/home/b.txt")
            .collect();
        assert_eq!(matches.len(), 1);
        assert!(matches[0].is_transferring);

        // Unloaded parent stays unloaded
        assert!(!storage.insert(
            "sftp://h:22/home/src/",
            Node::file("x", "sftp://h:22/home/src/x")
        ));
        assert!(!storage.is_loaded("sftp://h:22/home/src/"));
    }

    #[test]
    fn test_remove_directory_drops_descendant_listings() {
        let mut storage = DirectoryStorage::new();
        storage.load(ROOT, listing());
        storage.load("sftp://h:22/home/src/", Vec::new());
        storage.load("sftp://h:22/home/src/lib/", Vec::new());

        assert!(storage.remove(ROOT, "sftp://h:22/home/src/"));
        assert_eq!(storage.keys(), vec![ROOT.to_string()]);
        assert!(!storage.remove(ROOT, "sftp://h:22/home/missing.txt"));
    }

    #[test]
    fn test_remove_directory_named_without_slash() {
        let mut storage = DirectoryStorage::new();
        storage.load(ROOT, listing());
        storage.load("sftp://h:22/home/src/", Vec::new());

        assert!(storage.remove(ROOT, "sftp://h:22/home/src"));
        assert_eq!(storage.keys(), vec![ROOT.to_string()]);
        let tree = storage.build_tree("home", ROOT);
        assert!(tree.find("sftp://h:22/home/src/").is_none());
    }

    #[test]
    fn test_duplicate_listing_entries_keep_last() {
        let mut storage = DirectoryStorage::new();
        let stale = Node::file("b.txt", "sftp://h:22/home/b.txt");
        let mut fresh = stale.clone();
        fresh.is_transferring = true;
        storage.load(ROOT, vec![stale, Node::file("a.txt", "sftp://h:22/home/a.txt"), fresh]);

        let children = storage.children(ROOT).unwrap();
        assert_eq!(children.len(), 2);
        let b = children.iter().find(|n| n.name == "b.txt").unwrap();
        assert!(b.is_transferring);
    }
}
