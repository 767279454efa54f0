//! Listing pagination shared by every backend.
//!
//! Continuation tokens are opaque to callers: they are hex-encoded cursors
//! that only the issuing provider decodes. Backends whose client library
//! returns a directory in one go slice it with [`paginate`]; backends with a
//! native key cursor issue [`PageToken::After`] tokens instead.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::future::Future;

use super::result::{OperationError, OperationResult};
use super::types::{Entry, EntryType, ListOptions, ListResult, SortBy, SortOrder};

/// Decoded continuation token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageToken {
    /// Index into a filtered and sorted listing.
    Offset(usize),
    /// Resume after this key (native cursoring).
    After(String),
}

impl PageToken {
    pub fn encode(&self) -> String {
        let raw = match self {
            PageToken::Offset(offset) => format!("o:{}", offset),
            PageToken::After(key) => format!("k:{}", key),
        };
        hex::encode(raw)
    }

    pub fn decode(token: &str) -> OperationResult<Self> {
        let invalid = || {
            OperationError::invalid_input("Invalid continuation token")
                .with_code("invalid_continuation_token")
        };
        let bytes = hex::decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        match raw.split_once(':') {
            Some(("o", offset)) => offset
                .parse::<usize>()
                .map(PageToken::Offset)
                .map_err(|_| invalid()),
            Some(("k", key)) => Ok(PageToken::After(key.to_string())),
            _ => Err(invalid()),
        }
    }

    /// Decode an optional token into an offset. Key tokens are rejected.
    pub fn offset_of(token: Option<&str>) -> OperationResult<usize> {
        match token.map(PageToken::decode).transpose()? {
            None => Ok(0),
            Some(PageToken::Offset(offset)) => Ok(offset),
            Some(PageToken::After(_)) => Err(OperationError::invalid_input(
                "Continuation token was not issued by this listing",
            )
            .with_code("invalid_continuation_token")),
        }
    }
}

/// Whether `entry` passes the prefix/extension/hidden filters of `options`.
pub fn matches_filters(entry: &Entry, options: &ListOptions) -> bool {
    if !options.includes_hidden() && entry.is_hidden() {
        return false;
    }
    if let Some(prefix) = options.prefix.as_deref() {
        if !entry.name.starts_with(prefix) {
            return false;
        }
    }
    if let Some(ext) = options.extension.as_deref() {
        let wanted = ext.trim_start_matches('.');
        match entry.extension() {
            Some(actual) if actual.eq_ignore_ascii_case(wanted) => {}
            _ => return false,
        }
    }
    true
}

/// Drop entries rejected by the filters of `options`.
pub fn apply_filters(entries: Vec<Entry>, options: &ListOptions) -> Vec<Entry> {
    entries
        .into_iter()
        .filter(|e| matches_filters(e, options))
        .collect()
}

fn type_rank(entry_type: EntryType) -> u8 {
    match entry_type {
        EntryType::Bucket => 0,
        EntryType::Directory => 1,
        EntryType::Symlink => 2,
        EntryType::File => 3,
    }
}

fn by_name(a: &Entry, b: &Entry) -> Ordering {
    a.name
        .to_lowercase()
        .cmp(&b.name.to_lowercase())
        .then_with(|| a.path.cmp(&b.path))
}

/// Sort entries. Without an explicit key: directories first, then by name.
pub fn sort_entries(entries: &mut [Entry], sort_by: Option<SortBy>, order: SortOrder) {
    entries.sort_by(|a, b| {
        let ordering = match sort_by {
            None => match (a.is_dir(), b.is_dir()) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => by_name(a, b),
            },
            Some(SortBy::Name) => by_name(a, b),
            Some(SortBy::Modified) => a.modified.cmp(&b.modified).then_with(|| by_name(a, b)),
            Some(SortBy::Size) => a.size.cmp(&b.size).then_with(|| by_name(a, b)),
            Some(SortBy::Type) => type_rank(a.entry_type)
                .cmp(&type_rank(b.entry_type))
                .then_with(|| by_name(a, b)),
        };
        match order {
            SortOrder::Asc => ordering,
            SortOrder::Desc => ordering.reverse(),
        }
    });
}

/// Filter, sort and slice a complete listing into the page requested by
/// `options`.
pub fn paginate(entries: Vec<Entry>, options: &ListOptions, path: &str) -> OperationResult<ListResult> {
    let offset = PageToken::offset_of(options.continuation_token.as_deref())?;

    let mut entries = apply_filters(entries, options);
    sort_entries(&mut entries, options.sort_by, options.sort_order);

    let total = entries.len();
    if offset > total {
        return Err(OperationError::invalid_input("Continuation token is past the end of the listing")
            .with_code("invalid_continuation_token"));
    }
    let end = match options.limit {
        Some(limit) if limit > 0 => offset.saturating_add(limit).min(total),
        _ => total,
    };
    let has_more = end < total;
    let page: Vec<Entry> = entries.into_iter().skip(offset).take(end - offset).collect();

    Ok(ListResult {
        entries: page,
        continuation_token: has_more.then(|| PageToken::Offset(end).encode()),
        has_more,
        total_count: Some(total),
        path: Some(path.to_string()),
    })
}

/// Follow continuation tokens until the listing is exhausted.
///
/// `fetch` lists one page for the given options. A token that repeats is
/// reported as an error instead of looping forever.
pub async fn collect_pages<F, Fut>(options: ListOptions, mut fetch: F) -> OperationResult<Vec<Entry>>
where
    F: FnMut(ListOptions) -> Fut,
    Fut: Future<Output = OperationResult<ListResult>>,
{
    let mut entries = Vec::new();
    let mut seen_tokens = HashSet::new();
    let mut options = options;

    loop {
        let page = fetch(options.clone()).await?;
        entries.extend(page.entries);

        match page.continuation_token {
            Some(token) if page.has_more => {
                if !seen_tokens.insert(token.clone()) {
                    return Err(OperationError::error(
                        "Listing returned a repeated continuation token",
                    )
                    .with_code("pagination_loop"));
                }
                options.continuation_token = Some(token);
            }
            _ => break,
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn five_entries() -> Vec<Entry> {
        vec![
            Entry::file("/e.txt", 5, None),
            Entry::file("/a.txt", 1, None),
            Entry::directory("/dir"),
            Entry::file("/.hidden", 3, None),
            Entry::file("/b.csv", 2, None),
        ]
    }

    #[test]
    fn test_token_round_trip() {
        let token = PageToken::Offset(42).encode();
        assert_eq!(PageToken::decode(&token).unwrap(), PageToken::Offset(42));

        let token = PageToken::After("a/b:c".to_string()).encode();
        assert_eq!(
            PageToken::decode(&token).unwrap(),
            PageToken::After("a/b:c".to_string())
        );

        assert!(PageToken::decode("zz").is_err());
        assert!(PageToken::decode(&hex::encode("x:1")).is_err());
    }

    #[test]
    fn test_directories_first_then_name() {
        let mut entries = five_entries();
        sort_entries(&mut entries, None, SortOrder::Asc);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["dir", ".hidden", "a.txt", "b.csv", "e.txt"]);
    }

    #[test]
    fn test_sort_by_size_desc() {
        let mut entries = five_entries();
        sort_entries(&mut entries, Some(SortBy::Size), SortOrder::Desc);
        assert_eq!(entries[0].name, "e.txt");
        assert_eq!(entries.last().map(|e| e.name.as_str()), Some("dir"));
    }

    #[test]
    fn test_filters() {
        let hidden_off = ListOptions {
            include_hidden: Some(false),
            ..Default::default()
        };
        assert_eq!(apply_filters(five_entries(), &hidden_off).len(), 4);

        let csv = ListOptions {
            extension: Some(".CSV".to_string()),
            ..Default::default()
        };
        let only = apply_filters(five_entries(), &csv);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "b.csv");

        let prefixed = ListOptions {
            prefix: Some("d".to_string()),
            ..Default::default()
        };
        assert_eq!(apply_filters(five_entries(), &prefixed)[0].name, "dir");
    }

    #[test]
    fn test_limit_two_over_five_entries() {
        let first = paginate(five_entries(), &ListOptions::default().with_limit(2), "/").unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.has_more);
        assert_eq!(first.total_count, Some(5));

        let second = paginate(
            five_entries(),
            &ListOptions::default()
                .with_limit(2)
                .with_token(first.continuation_token.clone()),
            "/",
        )
        .unwrap();
        assert_eq!(second.entries.len(), 2);
        assert!(second.has_more);

        let third = paginate(
            five_entries(),
            &ListOptions::default()
                .with_limit(2)
                .with_token(second.continuation_token.clone()),
            "/",
        )
        .unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(!third.has_more);
        assert!(third.continuation_token.is_none());
    }

    #[test]
    fn test_collect_pages_has_no_duplicates_for_any_limit() {
        for limit in 1..=6 {
            let all = smol::block_on(collect_pages(
                ListOptions::default().with_limit(limit),
                |opts| async move { paginate(five_entries(), &opts, "/") },
            ))
            .unwrap();
            let mut paths: Vec<_> = all.iter().map(|e| e.path.clone()).collect();
            assert_eq!(paths.len(), 5, "limit {}", limit);
            paths.sort();
            paths.dedup();
            assert_eq!(paths.len(), 5, "limit {}", limit);
        }
    }

    #[test]
    fn test_collect_pages_detects_token_loop() {
        let result = smol::block_on(collect_pages(ListOptions::default(), |_| async {
            Ok(ListResult {
                entries: vec![Entry::file("x", 1, None)],
                continuation_token: Some("same".to_string()),
                has_more: true,
                total_count: None,
                path: None,
            })
        }));
        assert_eq!(result.unwrap_err().code(), "pagination_loop");
    }
}
