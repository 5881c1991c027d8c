use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

/// Turns a match argument into the list of patterns to match against.
#[async_trait]
pub trait PatternSource: Send + Sync {
    /// An empty list means there is nothing to match against; this is not
    /// an error.
    async fn resolve(&self, arg: &str) -> Vec<String>;
}

/// Filenames are `/a/file`, `./relative/file` or `file:<any path>`.
pub fn file_path(arg: &str) -> Option<&str> {
    if let Some(path) = arg.strip_prefix("file:") {
        Some(path)
    } else if arg.starts_with('/') || arg.starts_with("./") {
        Some(arg)
    } else {
        None
    }
}

pub fn is_file_ref(arg: &str) -> bool {
    file_path(arg).is_some()
}

/// Read a pattern list file: one pattern per line, blank and `#` comment
/// lines skipped, everything lower cased. A missing or unreadable file is
/// an empty list.
pub async fn read_list(path: &str) -> Vec<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_lowercase)
            .collect(),
        Err(e) => {
            log::debug!("Pattern file {path} unreadable, treating as empty: {e}");
            Vec::new()
        }
    }
}

/// File-backed pattern source for one connection.
///
/// Each file is read at most once per instance; a new connection gets a
/// new instance and so sees the file's current contents.
#[derive(Debug, Default)]
pub struct FilePatterns {
    cache: Mutex<HashMap<String, Vec<String>>>,
}

impl FilePatterns {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PatternSource for FilePatterns {
    async fn resolve(&self, arg: &str) -> Vec<String> {
        let Some(path) = file_path(arg) else {
            return vec![arg.to_string()];
        };
        let cached = match self.cache.lock() {
            Ok(cache) => cache.get(path).cloned(),
            Err(_) => None,
        };
        if let Some(list) = cached {
            return list;
        }
        let list = read_list(path).await;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(path.to_string(), list.clone());
        }
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_file_path_forms() {
        assert_eq!(file_path("/etc/list"), Some("/etc/list"));
        assert_eq!(file_path("./list"), Some("./list"));
        assert_eq!(file_path("file:list"), Some("list"));
        assert_eq!(file_path("list"), None);
        assert_eq!(file_path("@example.com"), None);
        assert_eq!(file_path("../list"), None);
    }

    #[tokio::test]
    async fn test_literal_argument() {
        let source = FilePatterns::new();
        assert_eq!(source.resolve("Joe@Example.com").await, vec!["Joe@Example.com"]);
    }

    #[tokio::test]
    async fn test_read_list_skips_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# senders we never want").unwrap();
        writeln!(file, "Spam@Example.com").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  @.bad.example  ").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let source = FilePatterns::new();
        assert_eq!(
            source.resolve(&format!("file:{path}")).await,
            vec!["spam@example.com", "@.bad.example"]
        );
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let source = FilePatterns::new();
        assert!(source.resolve("/no/such/file").await.is_empty());
        assert!(read_list("/no/such/file").await.is_empty());
    }

    #[tokio::test]
    async fn test_file_read_once_per_instance() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "first.example").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let source = FilePatterns::new();
        assert_eq!(source.resolve(&path).await, vec!["first.example"]);

        writeln!(file, "second.example").unwrap();
        assert_eq!(source.resolve(&path).await, vec!["first.example"]);
        assert_eq!(
            FilePatterns::new().resolve(&path).await,
            vec!["first.example", "second.example"]
        );
    }
}
