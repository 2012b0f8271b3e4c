use std::collections::HashMap;
use std::collections::HashSet;

/// A radix trie over `/`-segmented string keys.
///
/// Each node carries an explicit optional value so interior nodes are never
/// confused with stored values. Keys are segmented the way URL paths are:
/// `"com/google/play"` becomes `["com", "/google", "/play"]`, every segment
/// after the first keeping its leading slash.
#[derive(Debug)]
pub struct PathTrie<T> {
    value: Option<T>,
    children: HashMap<String, PathTrie<T>>,
}

impl<T> Default for PathTrie<T> {
    fn default() -> Self {
        Self {
            value: None,
            children: HashMap::new(),
        }
    }
}

impl<T> PathTrie<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` at `key`, replacing any previous value there.
    /// Returns `true` when the key was not present before.
    pub fn put(&mut self, key: &str, value: T) -> bool {
        let mut node = self;
        for segment in segments(key) {
            node = node.children.entry(segment.to_string()).or_default();
        }
        let is_new = node.value.is_none();
        node.value = Some(value);
        is_new
    }

    /// Descends along `key` as far as the trie allows and returns the value
    /// stored at the deepest reachable node, if any. A lookup that dead-ends
    /// on an interior node yields `None` even when an ancestor holds a value.
    pub fn search(&self, key: &str) -> Option<&T> {
        let mut node = self;
        for segment in segments(key) {
            match node.children.get(segment) {
                Some(child) => node = child,
                None => return node.value.as_ref(),
            }
        }
        node.value.as_ref()
    }

    /// Visits every value stored on the path from the root to `key`,
    /// shortest prefix first. The callback receives the full key prefix of
    /// each visited node.
    pub fn walk_path<'a>(&'a self, key: &str, mut walker: impl FnMut(&str, &'a T)) {
        if let Some(value) = &self.value {
            walker("", value);
        }
        let mut node = self;
        let mut consumed = 0usize;
        for segment in segments(key) {
            match node.children.get(segment) {
                Some(child) => {
                    node = child;
                    consumed += segment.len();
                    if let Some(value) = &node.value {
                        walker(&key[..consumed], value);
                    }
                }
                None => return,
            }
        }
    }
}

/// Iterates `/`-segmented parts of `path`, the first without a leading
/// slash, the rest with: `"a/b/c"` -> `"a"`, `"/b"`, `"/c"`.
fn segments(path: &str) -> impl Iterator<Item = &str> {
    let mut start = 0usize;
    std::iter::from_fn(move || {
        if start >= path.len() {
            return None;
        }
        let segment = match path[start + 1..].find('/') {
            Some(i) => &path[start..start + 1 + i],
            None => &path[start..],
        };
        start += segment.len();
        Some(segment)
    })
}

/// Matches URLs on two axes at once: domain *suffix* and path *prefix*.
///
/// A configured key `host[/path]` matches any request whose host ends with
/// `host` on a dotted-label boundary and whose path starts with `/path` on a
/// slash boundary; `www.client6.google.com/chat/log` is matched by
/// `google.com/chat`. Internally hosts are stored reversed
/// (`play.google.com` -> `com/google/play`) so suffix matching becomes
/// prefix matching.
#[derive(Debug, Default)]
pub struct UrlMatch<T> {
    hosts: PathTrie<bool>,
    values: PathTrie<T>,
}

impl<T> UrlMatch<T> {
    pub fn new() -> Self {
        Self {
            hosts: PathTrie::new(),
            values: PathTrie::new(),
        }
    }

    /// Registers `url` (shaped `host[/path...]`). Re-adding a key replaces
    /// its value.
    pub fn add(&mut self, url: &str, value: T) {
        let (host, path) = split_url(url);
        let host = reverse_host(host);
        self.hosts.put(&host, true);
        self.values.put(&format!("{host}{path}"), value);
    }

    /// Returns the best (deepest) configured value matching `(host, path)`.
    pub fn find(&self, host: &str, path: &str) -> Option<&T> {
        if host.is_empty() {
            return None;
        }
        let host = reverse_host(host);
        let mut hit = None;
        self.hosts.walk_path(&host, |key, marked| {
            if *marked && let Some(value) = self.values.search(&format!("{key}{path}")) {
                hit = Some(value);
            }
        });
        hit
    }

    /// Visits every configured value matching `(host, path)`, ordered from
    /// the shortest combined `reversed-host + path` key to the longest.
    pub fn walk_matches<'a>(&'a self, host: &str, path: &str, mut walker: impl FnMut(&str, &'a T)) {
        for (key, value) in self.matches(host, path) {
            walker(&key, value);
        }
    }

    fn matches<'a>(&'a self, host: &str, path: &str) -> Vec<(String, &'a T)> {
        if host.is_empty() {
            return Vec::new();
        }
        let host = reverse_host(host);
        let mut seen = HashSet::new();
        let mut hits = Vec::new();
        self.hosts.walk_path(&host, |host_key, marked| {
            if !*marked {
                return;
            }
            let combined = format!("{host_key}{path}");
            self.values.walk_path(&combined, |key, value| {
                if seen.insert(key.to_string()) {
                    hits.push((key.to_string(), value));
                }
            });
        });
        hits.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
        hits
    }
}

/// Drops the `*.` prefix configuration files may carry; host matching is
/// suffix-based, so the wildcard is implied.
pub(crate) fn strip_wildcard(host: &str) -> &str {
    host.strip_prefix("*.").unwrap_or(host)
}

/// Splits `host[/path...]` at the first slash.
pub fn split_url(url: &str) -> (&str, &str) {
    match url.find('/') {
        Some(i) if i > 0 => (&url[..i], &url[i..]),
        _ => (url, ""),
    }
}

fn reverse_host(host: &str) -> String {
    let mut labels: Vec<&str> = host.split('.').collect();
    labels.reverse();
    labels.join("/")
}
