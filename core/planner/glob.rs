use super::PlannerError;
use crate::model::{FileEntry, FileTree};
use globset::GlobBuilder;
use std::collections::BTreeSet;

/// Make a glob absolute and drop trailing slashes, so `*` and `/*/` both mean `/*`.
pub fn clean_glob(glob: &str) -> String {
    let trimmed = glob.trim();
    let trimmed = trimmed.trim_end_matches('/');
    if trimmed.is_empty() {
        return "/".to_string();
    }
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

pub fn validate_glob(glob: &str) -> Result<(), PlannerError> {
    let glob = clean_glob(glob);
    GlobBuilder::new(&glob)
        .literal_separator(true)
        .build()
        .map(|_| ())
        .map_err(|err| PlannerError::invalid_glob(&glob, err))
}

/// Split a tree into the groups of files a glob selects, one group per matched path, in path
/// order. A matched directory selects every file under it.
pub fn expand<'t>(
    tree: &'t FileTree,
    glob: &str,
) -> Result<Vec<Vec<(&'t String, &'t FileEntry)>>, PlannerError> {
    let glob = clean_glob(glob);

    if tree.is_empty() {
        return Ok(vec![]);
    }

    if glob == "/" {
        return Ok(vec![tree.iter().collect()]);
    }

    let matcher = GlobBuilder::new(&glob)
        .literal_separator(true)
        .build()
        .map_err(|err| PlannerError::invalid_glob(&glob, err))?
        .compile_matcher();

    let mut candidates: BTreeSet<String> = tree.directories();
    candidates.extend(tree.iter().map(|(path, _)| path.clone()));

    Ok(candidates
        .into_iter()
        .filter(|path| matcher.is_match(path))
        .map(|path| tree.walk(&path).collect::<Vec<_>>())
        .filter(|files| !files.is_empty())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContentHash, ObjectRef};

    fn tree(paths: &[&str]) -> FileTree {
        let mut tree = FileTree::new();
        for path in paths {
            tree.insert(
                path,
                FileEntry::single(ObjectRef {
                    hash: ContentHash::of(path.as_bytes()),
                    size: 1,
                }),
            );
        }
        tree
    }

    fn matched(tree: &FileTree, glob: &str) -> Vec<Vec<String>> {
        expand(tree, glob)
            .unwrap()
            .into_iter()
            .map(|files| files.into_iter().map(|(p, _)| p.clone()).collect())
            .collect()
    }

    #[test]
    fn root_glob_selects_the_whole_tree() {
        let t = tree(&["/a", "/b/c"]);
        assert_eq!(matched(&t, "/"), vec![vec!["/a", "/b/c"]]);
    }

    #[test]
    fn star_selects_top_level_entries() {
        let t = tree(&["/a", "/b/c", "/b/d"]);
        assert_eq!(matched(&t, "/*"), vec![vec!["/a"], vec!["/b/c", "/b/d"]]);
        assert_eq!(matched(&t, "*"), matched(&t, "/*"));
    }

    #[test]
    fn nested_globs_do_not_cross_directories() {
        let t = tree(&["/a", "/b/c", "/b/d/e"]);
        assert_eq!(matched(&t, "/*/*"), vec![vec!["/b/c"], vec!["/b/d/e"]]);
    }

    #[test]
    fn empty_trees_have_no_datums() {
        assert!(matched(&FileTree::new(), "/").is_empty());
        assert!(matched(&FileTree::new(), "/*").is_empty());
    }

    #[test]
    fn bad_globs_are_rejected() {
        assert_matches!(validate_glob("/[a"), Err(PlannerError::InvalidGlob { .. }));
        assert!(validate_glob("/*").is_ok());
    }
}
