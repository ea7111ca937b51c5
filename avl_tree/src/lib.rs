use std::{
    cmp::Ordering, fmt, marker::PhantomData, mem, ptr::NonNull, str::FromStr,
};

struct Node<T> {
    key: T,
    parent: Option<NonNull<Node<T>>>,
    left: Option<NonNull<Node<T>>>,
    right: Option<NonNull<Node<T>>>,
    height: i32,
}

/// An ordered set of unique keys, kept balanced by AVL rotations.
///
/// The tree keeps a cursor: `search` and `insert` leave it on the
/// located node, `remove` consumes it. The cursor is tree-local mutable
/// state, so the tree is deliberately `!Send`/`!Sync`.
pub struct AvlTree<T> {
    root: Option<NonNull<Node<T>>>,
    current: Option<NonNull<Node<T>>>,
    len: usize,
}

impl<T> Node<T> {
    fn new(key: T, parent: Option<NonNull<Node<T>>>) -> NonNull<Self> {
        NonNull::from(Box::leak(Box::new(Self {
            key,
            parent,
            left: None,
            right: None,
            height: 0,
        })))
    }
}

// a missing child counts as height -1
fn node_height<T>(node: Option<NonNull<Node<T>>>) -> i32 {
    node.map_or(-1, |n| unsafe { (*n.as_ptr()).height })
}

unsafe fn update_height<T>(node: NonNull<Node<T>>) {
    let n = node.as_ptr();
    (*n).height = 1 + node_height((*n).left).max(node_height((*n).right));
}

unsafe fn balance_factor<T>(node: NonNull<Node<T>>) -> i32 {
    let n = node.as_ptr();
    node_height((*n).right) - node_height((*n).left)
}

unsafe fn leftmost<T>(mut node: NonNull<Node<T>>) -> NonNull<Node<T>> {
    while let Some(left) = (*node.as_ptr()).left {
        node = left;
    }
    node
}

unsafe fn subtree_len<T>(node: Option<NonNull<Node<T>>>) -> usize {
    node.map_or(0, |n| {
        1 + subtree_len((*n.as_ptr()).left) + subtree_len((*n.as_ptr()).right)
    })
}

unsafe fn drop_subtree<T>(node: NonNull<Node<T>>) {
    let node = Box::from_raw(node.as_ptr());
    if let Some(left) = node.left {
        drop_subtree(left);
    }
    if let Some(right) = node.right {
        drop_subtree(right);
    }
}

unsafe fn is_search_subtree<T: Ord>(
    node: Option<NonNull<Node<T>>>,
    lo: Option<&T>,
    hi: Option<&T>,
) -> bool {
    let Some(n) = node else { return true };
    let n = n.as_ptr();
    let key = &(*n).key;
    lo.map_or(true, |lo| lo < key)
        && hi.map_or(true, |hi| key < hi)
        && is_search_subtree((*n).left, lo, Some(key))
        && is_search_subtree((*n).right, Some(key), hi)
}

// the subtree's height, or `None` if some node violates the balance
// invariant or caches a stale height
unsafe fn balanced_height<T>(node: Option<NonNull<Node<T>>>) -> Option<i32> {
    let Some(n) = node else { return Some(-1) };
    let n = n.as_ptr();
    let left = balanced_height((*n).left)?;
    let right = balanced_height((*n).right)?;
    let height = 1 + left.max(right);
    ((right - left).abs() <= 1 && (*n).height == height).then_some(height)
}

impl<T> AvlTree<T> {
    pub fn new() -> Self { Self { root: None, current: None, len: 0 } }
    pub fn is_empty(&self) -> bool { self.root.is_none() }
    pub fn len(&self) -> usize { self.len }
    /// The tree's height; `-1` for the empty tree.
    pub fn height(&self) -> i32 { node_height(self.root) }
    pub fn root(&self) -> Option<&T> {
        self.root.map(|n| unsafe { &(*n.as_ptr()).key })
    }
    /// The key under the cursor, if the cursor is positioned.
    pub fn current(&self) -> Option<&T> {
        self.current.map(|n| unsafe { &(*n.as_ptr()).key })
    }
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.root.map(|root| unsafe { leftmost(root) }),
            _marker: PhantomData,
        }
    }

    /// Replaces `parent`'s link to `old` by `new` and reparents `new`;
    /// `old` becomes detached. `parent == None` means `old` was the root.
    unsafe fn replace_child(
        &mut self,
        parent: Option<NonNull<Node<T>>>,
        old: NonNull<Node<T>>,
        new: Option<NonNull<Node<T>>>,
    ) {
        match parent {
            None => self.root = new,
            Some(p) => {
                let p = p.as_ptr();
                if (*p).left == Some(old) {
                    (*p).left = new;
                } else {
                    (*p).right = new;
                }
            }
        }
        if let Some(new) = new {
            (*new.as_ptr()).parent = parent;
        }
    }

    // lowers `node` and raises its right child; returns the subtree's
    // new root
    unsafe fn rotate_left(
        &mut self,
        node: NonNull<Node<T>>,
    ) -> NonNull<Node<T>> {
        let n = node.as_ptr();
        let raised = (*n).right.unwrap();
        let r = raised.as_ptr();
        let parent = (*n).parent;
        (*n).right = (*r).left;
        if let Some(mid) = (*r).left {
            (*mid.as_ptr()).parent = Some(node);
        }
        (*r).left = Some(node);
        (*n).parent = Some(raised);
        self.replace_child(parent, node, Some(raised));
        update_height(node);
        update_height(raised);
        raised
    }

    unsafe fn rotate_right(
        &mut self,
        node: NonNull<Node<T>>,
    ) -> NonNull<Node<T>> {
        let n = node.as_ptr();
        let raised = (*n).left.unwrap();
        let r = raised.as_ptr();
        let parent = (*n).parent;
        (*n).left = (*r).right;
        if let Some(mid) = (*r).right {
            (*mid.as_ptr()).parent = Some(node);
        }
        (*r).right = Some(node);
        (*n).parent = Some(raised);
        self.replace_child(parent, node, Some(raised));
        update_height(node);
        update_height(raised);
        raised
    }

    // walks from `node` up to the root, refreshing heights and rotating
    // wherever the balance factor leaves [-1, 1]
    unsafe fn rebalance_from(&mut self, mut node: Option<NonNull<Node<T>>>) {
        while let Some(n) = node {
            update_height(n);
            let top = match balance_factor(n) {
                -2 => {
                    let child = (*n.as_ptr()).left.unwrap();
                    if balance_factor(child) > 0 {
                        self.rotate_left(child);
                    }
                    self.rotate_right(n)
                }
                2 => {
                    let child = (*n.as_ptr()).right.unwrap();
                    if balance_factor(child) < 0 {
                        self.rotate_right(child);
                    }
                    self.rotate_left(n)
                }
                _ => n,
            };
            node = (*top.as_ptr()).parent;
        }
    }
}

impl<T: Ord> AvlTree<T> {
    fn check_invariants(&self) {
        debug_assert!(unsafe {
            is_search_subtree(self.root, None, None)
        });
        debug_assert!(unsafe { balanced_height(self.root).is_some() });
    }

    fn locate(&self, key: &T) -> Option<NonNull<Node<T>>> {
        let mut cur = self.root;
        while let Some(n) = cur {
            cur = match key.cmp(unsafe { &(*n.as_ptr()).key }) {
                Ordering::Equal => return Some(n),
                Ordering::Less => unsafe { (*n.as_ptr()).left },
                Ordering::Greater => unsafe { (*n.as_ptr()).right },
            };
        }
        None
    }

    /// Whether `key` is present. Does not move the cursor.
    pub fn has(&self, key: &T) -> bool {
        self.check_invariants();
        self.locate(key).is_some()
    }

    /// Moves the cursor to `key`'s node and returns whether it was
    /// found; the cursor is cleared on a miss.
    pub fn search(&mut self, key: &T) -> bool {
        self.check_invariants();
        self.current = self.locate(key);
        self.current.is_some()
    }

    /// Inserts `key` and leaves the cursor on the new node.
    ///
    /// # Panics
    /// Panics if `key` is already present.
    pub fn insert(&mut self, key: T) {
        self.check_invariants();
        let Some(mut cur) = self.root else {
            let node = Node::new(key, None);
            self.root = Some(node);
            self.current = Some(node);
            self.len = 1;
            return;
        };
        let new = loop {
            let c = cur.as_ptr();
            match key.cmp(unsafe { &(*c).key }) {
                Ordering::Equal => {
                    panic!("`insert` requires that the key is not present")
                }
                Ordering::Less => match unsafe { (*c).left } {
                    Some(child) => cur = child,
                    None => {
                        let new = Node::new(key, Some(cur));
                        unsafe { (*c).left = Some(new) };
                        break new;
                    }
                },
                Ordering::Greater => match unsafe { (*c).right } {
                    Some(child) => cur = child,
                    None => {
                        let new = Node::new(key, Some(cur));
                        unsafe { (*c).right = Some(new) };
                        break new;
                    }
                },
            }
        };
        self.len += 1;
        self.current = Some(new);
        unsafe { self.rebalance_from(Some(cur)) };
        self.check_invariants();
    }

    /// Removes the key under the cursor and returns it; the cursor is
    /// cleared.
    ///
    /// # Panics
    /// Panics if the cursor is not positioned.
    pub fn remove(&mut self) -> T {
        let cur = self
            .current
            .expect("`remove` requires the cursor; call `search` first");
        self.check_invariants();
        self.current = None;
        unsafe {
            let c = cur.as_ptr();
            let node = if (*c).left.is_some() && (*c).right.is_some() {
                // swap the key with the in-order successor, which has at
                // most one child, and unlink that node instead
                let succ = leftmost((*c).right.unwrap());
                mem::swap(&mut (*c).key, &mut (*succ.as_ptr()).key);
                succ
            } else {
                cur
            };
            let n = node.as_ptr();
            let parent = (*n).parent;
            let child = (*n).left.or((*n).right);
            self.replace_child(parent, node, child);
            let key = Box::from_raw(n).key;
            self.len -= 1;
            self.rebalance_from(parent);
            self.check_invariants();
            key
        }
    }

    // takes over a detached subtree whose cached heights are already
    // consistent; both invariants are re-checked
    fn set_root(&mut self, root: Option<NonNull<Node<T>>>) {
        self.root = root;
        self.current = None;
        self.len = unsafe { subtree_len(root) };
        self.check_invariants();
    }
}

impl<T> Default for AvlTree<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Drop for AvlTree<T> {
    fn drop(&mut self) {
        if let Some(root) = self.root {
            unsafe { drop_subtree(root) }
        }
    }
}

impl<T: Ord> FromIterator<T> for AvlTree<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let mut tree = Self::new();
        for key in iter {
            tree.insert(key);
        }
        tree
    }
}

pub struct Iter<'a, T> {
    next: Option<NonNull<Node<T>>>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;
    fn next(&mut self) -> Option<&'a T> {
        let node = self.next?;
        unsafe {
            let n = node.as_ptr();
            self.next = match (*n).right {
                Some(right) => Some(leftmost(right)),
                None => {
                    // climb until we leave a left subtree
                    let mut child = node;
                    let mut parent = (*n).parent;
                    while let Some(p) = parent {
                        if (*p.as_ptr()).left == Some(child) {
                            break;
                        }
                        child = p;
                        parent = (*p.as_ptr()).parent;
                    }
                    parent
                }
            };
            Some(&(*n).key)
        }
    }
}

impl<'a, T> IntoIterator for &'a AvlTree<T> {
    type Item = &'a T;
    type IntoIter = Iter<'a, T>;
    fn into_iter(self) -> Iter<'a, T> { self.iter() }
}

unsafe fn fold<T: fmt::Display>(
    f: &mut fmt::Formatter<'_>,
    node: Option<NonNull<Node<T>>>,
) -> fmt::Result {
    f.write_str("[")?;
    if let Some(n) = node {
        let n = n.as_ptr();
        write!(f, "{} : ", (*n).key)?;
        fold(f, (*n).left)?;
        f.write_str(" : ")?;
        fold(f, (*n).right)?;
    }
    f.write_str("]")
}

/// Folds the tree as `[key : <left> : <right>]`, `[]` for missing
/// subtrees and for the empty tree.
impl<T: fmt::Display> fmt::Display for AvlTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        unsafe { fold(f, self.root) }
    }
}

impl<T: fmt::Debug> fmt::Debug for AvlTree<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UnfoldError {
    UnexpectedEnd,
    Unexpected(usize),
    Key(usize),
    Trailing(usize),
}

impl fmt::Display for UnfoldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnfoldError::UnexpectedEnd => write!(f, "unexpected end of input"),
            UnfoldError::Unexpected(pos) => {
                write!(f, "unexpected character at byte {pos}")
            }
            UnfoldError::Key(pos) => write!(f, "malformed key at byte {pos}"),
            UnfoldError::Trailing(pos) => {
                write!(f, "trailing input at byte {pos}")
            }
        }
    }
}

impl std::error::Error for UnfoldError {}

// owns a parsed subtree until it is linked into a tree, so that a parse
// error frees everything built so far
struct Subtree<T>(Option<NonNull<Node<T>>>);

impl<T> Subtree<T> {
    fn take(mut self) -> Option<NonNull<Node<T>>> { self.0.take() }
}

impl<T> Drop for Subtree<T> {
    fn drop(&mut self) {
        if let Some(node) = self.0 {
            unsafe { drop_subtree(node) }
        }
    }
}

struct Unfolder<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Unfolder<'a> {
    fn skip_spaces(&mut self) {
        let rest = &self.src[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
    }
    fn peek(&self) -> Option<char> { self.src[self.pos..].chars().next() }
    fn expect(&mut self, c: char) -> Result<(), UnfoldError> {
        self.skip_spaces();
        match self.peek() {
            Some(found) if found == c => {
                self.pos += c.len_utf8();
                Ok(())
            }
            Some(_) => Err(UnfoldError::Unexpected(self.pos)),
            None => Err(UnfoldError::UnexpectedEnd),
        }
    }
    fn key<T: FromStr>(&mut self) -> Result<T, UnfoldError> {
        self.skip_spaces();
        let start = self.pos;
        let rest = &self.src[start..];
        let len = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '[' | ']' | ':'))
            .unwrap_or(rest.len());
        self.pos += len;
        rest[..len].parse().map_err(|_| UnfoldError::Key(start))
    }
    fn node<T: FromStr>(&mut self) -> Result<Subtree<T>, UnfoldError> {
        self.expect('[')?;
        self.skip_spaces();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(Subtree(None));
        }
        let key = self.key()?;
        self.expect(':')?;
        let left = self.node()?;
        self.expect(':')?;
        let right = self.node()?;
        self.expect(']')?;
        let node = Node::new(key, None);
        unsafe {
            let n = node.as_ptr();
            (*n).left = left.take();
            (*n).right = right.take();
            if let Some(l) = (*n).left {
                (*l.as_ptr()).parent = Some(node);
            }
            if let Some(r) = (*n).right {
                (*r.as_ptr()).parent = Some(node);
            }
            update_height(node);
        }
        Ok(Subtree(Some(node)))
    }
}

/// Unfolds a tree from the `[key : <left> : <right>]` format. Malformed
/// input is reported as an `UnfoldError`; no tree is built in that case.
impl<T: Ord + FromStr> FromStr for AvlTree<T> {
    type Err = UnfoldError;
    fn from_str(s: &str) -> Result<Self, UnfoldError> {
        let mut unfolder = Unfolder { src: s, pos: 0 };
        let root = unfolder.node()?;
        unfolder.skip_spaces();
        if unfolder.pos != s.len() {
            return Err(UnfoldError::Trailing(unfolder.pos));
        }
        let mut tree = Self::new();
        tree.set_root(root.take());
        Ok(tree)
    }
}

#[test]
fn sanity_check() {
    let mut tree = AvlTree::new();
    assert!(tree.is_empty());
    assert_eq!(tree.height(), -1);
    tree.insert(4);
    tree.insert(2);
    tree.insert(6);
    assert_eq!(tree.len(), 3);
    assert_eq!(tree.root(), Some(&4));
    assert!(tree.has(&2) && tree.has(&4) && tree.has(&6));
    assert!(!tree.has(&5));
    assert!(tree.search(&6));
    assert_eq!(tree.current(), Some(&6));
    assert_eq!(tree.remove(), 6);
    assert_eq!(tree.current(), None);
    assert!(!tree.has(&6));
    assert_eq!(tree.len(), 2);
}

#[test]
fn single_rotation() {
    let tree: AvlTree<_> = [1, 2, 3].into_iter().collect();
    assert_eq!(tree.to_string(), "[2 : [1 : [] : []] : [3 : [] : []]]");
    let tree: AvlTree<_> = [3, 2, 1].into_iter().collect();
    assert_eq!(tree.to_string(), "[2 : [1 : [] : []] : [3 : [] : []]]");
}

#[test]
fn double_rotation() {
    let tree: AvlTree<_> = [3, 1, 2].into_iter().collect();
    assert_eq!(tree.to_string(), "[2 : [1 : [] : []] : [3 : [] : []]]");
    let tree: AvlTree<_> = [1, 3, 2].into_iter().collect();
    assert_eq!(tree.to_string(), "[2 : [1 : [] : []] : [3 : [] : []]]");
}

#[test]
fn remove_with_two_children() {
    let mut tree: AvlTree<_> = [2, 1, 3, 4].into_iter().collect();
    assert!(tree.search(&2));
    assert_eq!(tree.remove(), 2);
    assert!(tree.iter().copied().eq([1, 3, 4]));
}

#[test]
fn remove_all_cases() {
    let keys = [5, 3, 8, 2, 4, 7, 9, 1, 6];
    let mut tree: AvlTree<_> = keys.into_iter().collect();
    for (i, key) in keys.iter().enumerate() {
        assert!(tree.search(key));
        assert_eq!(tree.remove(), *key);
        assert!(!tree.has(key));
        let mut rest = keys[i + 1..].to_vec();
        rest.sort_unstable();
        assert!(tree.iter().copied().eq(rest));
    }
    assert!(tree.is_empty());
}

#[test]
fn cursor_positioning() {
    let mut tree: AvlTree<_> = [2, 1, 3].into_iter().collect();
    assert_eq!(tree.current(), Some(&3));
    assert!(!tree.search(&10));
    assert_eq!(tree.current(), None);
    assert!(tree.search(&1));
    assert_eq!(tree.current(), Some(&1));
    tree.insert(4);
    assert_eq!(tree.current(), Some(&4));
    tree.remove();
    assert_eq!(tree.current(), None);
}

#[test]
fn has_does_not_move_cursor() {
    let mut tree: AvlTree<_> = [2, 1, 3].into_iter().collect();
    assert!(tree.search(&2));
    assert!(tree.has(&1));
    assert!(!tree.has(&10));
    assert_eq!(tree.current(), Some(&2));
}

#[test]
fn in_order_iteration() {
    let tree: AvlTree<_> = [4, 1, 6, 0, 2, 5, 7, 3].into_iter().collect();
    assert!(tree.iter().copied().eq(0..8));
    let empty = AvlTree::<i32>::new();
    assert_eq!(empty.iter().next(), None);
    assert_eq!(format!("{tree:?}"), "{0, 1, 2, 3, 4, 5, 6, 7}");
}

#[test]
fn height_bound() {
    let mut tree = AvlTree::new();
    for n in 1..=1024_u32 {
        tree.insert(n);
        let bound = 1.44 * f64::from(n + 2).log2() - 1.0;
        assert!(f64::from(tree.height()) <= bound);
    }
}

#[test]
fn fold_unfold_round_trip() {
    for n in 0..64_u32 {
        let tree: AvlTree<_> = (0..n).map(|i| i * 37 % 64).collect();
        let folded = tree.to_string();
        let unfolded: AvlTree<u32> = folded.parse().unwrap();
        assert_eq!(unfolded.to_string(), folded);
        assert_eq!(unfolded.len(), tree.len());
    }
    let empty: AvlTree<u32> = "[]".parse().unwrap();
    assert!(empty.is_empty());
    let padded: AvlTree<u32> = "  [ 1 : [ ] : [ 2 : [] : [] ] ]  ".parse().unwrap();
    assert_eq!(padded.to_string(), "[1 : [] : [2 : [] : []]]");
}

#[test]
fn unfold_rejects_malformed_input() {
    let err = |s: &str| s.parse::<AvlTree<i32>>().unwrap_err();
    assert_eq!(err(""), UnfoldError::UnexpectedEnd);
    assert_eq!(err("[1 : [2]"), UnfoldError::Unexpected(7));
    assert_eq!(err("[1 : []"), UnfoldError::UnexpectedEnd);
    assert_eq!(err("[x : [] : []]"), UnfoldError::Key(1));
    assert_eq!(err("[1 : [] : []] junk"), UnfoldError::Trailing(14));
    assert_eq!(err("1"), UnfoldError::Unexpected(0));
    assert_eq!(err("[1 [] : []]"), UnfoldError::Unexpected(3));
}

#[test]
#[should_panic]
fn insert_duplicate_panics() {
    let mut tree: AvlTree<_> = [1, 2].into_iter().collect();
    tree.insert(1);
}

#[test]
#[should_panic]
fn remove_without_cursor_panics() {
    let mut tree: AvlTree<_> = [1].into_iter().collect();
    tree.search(&0);
    tree.remove();
}

#[test]
fn random_workload_matches_btree_set() {
    use std::collections::BTreeSet;

    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha20Rng;

    let mut rng = ChaCha20Rng::from_seed([0xA5; 32]);
    for _ in 0..10 {
        let mut tree = AvlTree::new();
        let mut expected = BTreeSet::new();
        for _ in 0..500 {
            let key = rng.gen_range(0..200_u32);
            if expected.contains(&key) {
                assert!(tree.search(&key));
                assert_eq!(tree.remove(), key);
                expected.remove(&key);
            } else {
                tree.insert(key);
                assert_eq!(tree.current(), Some(&key));
                expected.insert(key);
            }
            assert_eq!(tree.len(), expected.len());
            let n = tree.len() as f64;
            assert!(f64::from(tree.height()) <= 1.44 * (n + 2.0).log2() - 1.0);
        }
        assert!(tree.iter().eq(expected.iter()));
        let folded = tree.to_string();
        let unfolded: AvlTree<u32> = folded.parse().unwrap();
        assert_eq!(unfolded.to_string(), folded);
    }
}
