//! # Datum Planning
//!
//! Turns an input expression and the commits its leaves are pinned to into an ordered list of
//! datums. Planning is pure: the same commits always give the same datums in the same order,
//! which is what makes paginated datum listings stable.
//!

mod error;
mod glob;

pub use error::*;
pub use glob::*;

use crate::model::{CommitId, Datum, DatumFile, FileTree, Input};
use serde_derive::{Deserialize, Serialize};

/// A leaf of the input expression, pinned to a commit and its content.
#[derive(Debug, Clone)]
pub struct LeafSnapshot {
    pub name: String,
    pub repo: String,
    pub glob: String,
    /// `None` when the leaf has no commit to read, like an unready union branch.
    pub commit: Option<CommitId>,
    pub tree: FileTree,
}

#[derive(Default, Debug, Clone)]
pub struct DatumPlanner;

impl DatumPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Plan the datums of `input`. `leaves` must be in the depth-first order of
    /// [Input::leaves].
    pub fn plan(&self, input: &Input, leaves: &[LeafSnapshot]) -> Result<Vec<Datum>, PlannerError> {
        if leaves.len() != input.leaf_count() {
            return Err(PlannerError::LeafMismatch {
                expected: input.leaf_count(),
                found: leaves.len(),
            });
        }
        let mut cursor = 0;
        self.plan_from(input, leaves, &mut cursor)
    }

    fn plan_from(
        &self,
        input: &Input,
        leaves: &[LeafSnapshot],
        cursor: &mut usize,
    ) -> Result<Vec<Datum>, PlannerError> {
        match input {
            Input::Atom(_) | Input::Cron(_) | Input::Git(_) => {
                let leaf = &leaves[*cursor];
                *cursor += 1;
                self.plan_leaf(leaf)
            }

            Input::Union(inputs) => {
                let mut datums = vec![];
                for input in inputs {
                    datums.extend(self.plan_from(input, leaves, cursor)?);
                }
                Ok(datums)
            }

            Input::Cross(inputs) => {
                // Every child has to be planned to keep the cursor in step, even when an earlier
                // one came out empty.
                let children = inputs
                    .iter()
                    .map(|input| self.plan_from(input, leaves, cursor))
                    .collect::<Result<Vec<Vec<Datum>>, PlannerError>>()?;
                Ok(cross_product(&children))
            }
        }
    }

    fn plan_leaf(&self, leaf: &LeafSnapshot) -> Result<Vec<Datum>, PlannerError> {
        let commit = match leaf.commit {
            Some(commit) => commit,
            None => return Ok(vec![]),
        };

        Ok(expand(&leaf.tree, &leaf.glob)?
            .into_iter()
            .map(|files| {
                let files = files
                    .into_iter()
                    .map(|(path, entry)| DatumFile {
                        input: leaf.name.clone(),
                        repo: leaf.repo.clone(),
                        commit,
                        path: path.clone(),
                        entry: entry.clone(),
                    })
                    .collect();
                Datum::from_files(files)
            })
            .collect())
    }
}

/// The cartesian product of the children's datums. The first child varies slowest.
fn cross_product(children: &[Vec<Datum>]) -> Vec<Datum> {
    if children.is_empty() || children.iter().any(|c| c.is_empty()) {
        return vec![];
    }

    let mut combos: Vec<Vec<&Datum>> = vec![vec![]];
    for child in children {
        let mut next = Vec::with_capacity(combos.len() * child.len());
        for combo in &combos {
            for datum in child {
                let mut extended = combo.clone();
                extended.push(datum);
                next.push(extended);
            }
        }
        combos = next;
    }

    combos.iter().map(|parts| Datum::cross(parts)).collect()
}

/// A page of a larger, stably ordered listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
    pub total: usize,
}

impl<T: Clone> Page<T> {
    /// Slice out page `page` of `items`. A `page_size` of zero returns everything as one page.
    pub fn of(items: &[T], page: usize, page_size: usize) -> Self {
        let total = items.len();
        if page_size == 0 {
            return Self {
                items: items.to_vec(),
                page: 0,
                page_size: total,
                total_pages: 1,
                total,
            };
        }

        let total_pages = (total + page_size - 1) / page_size;
        let start = page.saturating_mul(page_size).min(total);
        let end = (start + page_size).min(total);
        Self {
            items: items[start..end].to_vec(),
            page,
            page_size,
            total_pages,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentHash, FileEntry, ObjectRef};

    fn snapshot(name: &str, glob: &str, files: &[(&str, &str)]) -> LeafSnapshot {
        let mut tree = FileTree::new();
        for (path, content) in files {
            tree.insert(
                path,
                FileEntry::single(ObjectRef {
                    hash: ContentHash::of(content.as_bytes()),
                    size: content.len() as u64,
                }),
            );
        }
        LeafSnapshot {
            name: name.to_string(),
            repo: name.to_string(),
            glob: glob.to_string(),
            commit: Some(CommitId::default()),
            tree,
        }
    }

    #[test]
    fn atom_inputs_give_one_datum_per_match() {
        let input = Input::atom("a", "/*");
        let leaves = [snapshot("a", "/*", &[("/1", "x"), ("/2", "y"), ("/3", "z")])];
        let datums = DatumPlanner::new().plan(&input, &leaves).unwrap();
        assert_eq!(datums.len(), 3);
        assert_eq!(datums[0].files[0].path, "/1");
    }

    #[test]
    fn cross_inputs_multiply() {
        let input = Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]);
        let leaves = [
            snapshot("a", "/*", &[("/1", "x"), ("/2", "y")]),
            snapshot("b", "/*", &[("/1", "p"), ("/2", "q"), ("/3", "r")]),
        ];
        let datums = DatumPlanner::new().plan(&input, &leaves).unwrap();
        assert_eq!(datums.len(), 6);
        assert!(datums.iter().all(|d| d.files.len() == 2));
        assert_eq!(datums[0].files[0].repo, "a");
        assert_eq!(datums[0].files[1].repo, "b");
    }

    #[test]
    fn cross_with_an_empty_side_is_empty() {
        let input = Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]);
        let leaves = [
            snapshot("a", "/*", &[("/1", "x")]),
            snapshot("b", "/*", &[]),
        ];
        assert!(DatumPlanner::new().plan(&input, &leaves).unwrap().is_empty());
    }

    #[test]
    fn union_inputs_concatenate() {
        let input = Input::Union(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]);
        let mut unready = snapshot("b", "/*", &[("/1", "p")]);
        unready.commit = None;
        let leaves = [snapshot("a", "/*", &[("/1", "x"), ("/2", "y")]), unready];
        let datums = DatumPlanner::new().plan(&input, &leaves).unwrap();
        assert_eq!(datums.len(), 2);

        let leaves = [
            snapshot("a", "/*", &[("/1", "x"), ("/2", "y")]),
            snapshot("b", "/*", &[("/1", "p")]),
        ];
        assert_eq!(DatumPlanner::new().plan(&input, &leaves).unwrap().len(), 3);
    }

    #[test]
    fn planning_is_deterministic() {
        let input = Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/")]);
        let leaves = [
            snapshot("a", "/*", &[("/1", "x"), ("/2", "y")]),
            snapshot("b", "/", &[("/1", "p"), ("/2", "q")]),
        ];
        let planner = DatumPlanner::new();
        let first: Vec<_> = planner.plan(&input, &leaves).unwrap();
        let second: Vec<_> = planner.plan(&input, &leaves).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn same_content_under_another_name_is_another_datum() {
        let a = DatumPlanner::new()
            .plan(&Input::atom("a", "/"), &[snapshot("a", "/", &[("/f", "x")])])
            .unwrap();
        let b = DatumPlanner::new()
            .plan(&Input::atom("b", "/"), &[snapshot("b", "/", &[("/f", "x")])])
            .unwrap();
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn leaf_counts_must_line_up() {
        let input = Input::Cross(vec![Input::atom("a", "/*"), Input::atom("b", "/*")]);
        assert_matches!(
            DatumPlanner::new().plan(&input, &[snapshot("a", "/*", &[])]),
            Err(PlannerError::LeafMismatch { expected: 2, found: 1 })
        );
    }

    #[test]
    fn pages_cover_every_item_once() {
        let items: Vec<u32> = (0..10).collect();
        let first = Page::of(&items, 0, 4);
        let last = Page::of(&items, 2, 4);
        assert_eq!(first.items, vec![0, 1, 2, 3]);
        assert_eq!(last.items, vec![8, 9]);
        assert_eq!(first.total_pages, 3);
        assert!(Page::of(&items, 5, 4).items.is_empty());
        assert_eq!(Page::of(&items, 0, 0).items.len(), 10);
    }

    #[quickcheck]
    fn pages_reassemble_the_listing(items: Vec<u8>, page_size: u8) -> bool {
        let page_size = (page_size as usize % 7) + 1;
        let first = Page::of(&items, 0, page_size);
        let mut all = vec![];
        for page in 0..first.total_pages {
            all.extend(Page::of(&items, page, page_size).items);
        }
        all == items
    }
}
