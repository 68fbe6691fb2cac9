use std::collections::BTreeMap;

/// Case-insensitive HTTP header collection with normalized storage keys.
///
/// Header names are normalized on every access: each `-`-delimited token is
/// titlecased, except a fixed table of acronyms (`WWW`, `ETag`, `MD5`, `TE`,
/// `DNI`) which keep their canonical casing. Multi-valued headers are stored
/// pre-joined with the field-appropriate delimiter (`"; "` for `Cookie`,
/// `","` otherwise).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderSet {
    entries: BTreeMap<String, String>,
}

/// Acronym tokens preserved verbatim instead of titlecased.
const KNOWN_ACRONYMS: &[&str] = &["WWW", "ETag", "MD5", "TE", "DNI"];

/// Normalizes a header name. Returns `None` for an empty name.
pub fn normalize(name: &str) -> Option<String> {
    if name.is_empty() {
        return None;
    }

    let mut normalized = String::with_capacity(name.len());
    for (index, token) in name.split('-').enumerate() {
        if index > 0 {
            normalized.push('-');
        }
        if let Some(acronym) = KNOWN_ACRONYMS
            .iter()
            .find(|acronym| acronym.eq_ignore_ascii_case(token))
        {
            normalized.push_str(acronym);
            continue;
        }
        for (position, character) in token.chars().enumerate() {
            if !character.is_ascii_alphanumeric() {
                normalized.push('_');
            } else if position == 0 {
                normalized.push(character.to_ascii_uppercase());
            } else {
                normalized.push(character.to_ascii_lowercase());
            }
        }
    }
    Some(normalized)
}

fn delimiter_for(normalized_name: &str) -> &'static str {
    if normalized_name == "Cookie" { "; " } else { "," }
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let name = normalize(name)?;
        self.entries.get(&name).map(String::as_str)
    }

    /// Replaces the value for `name`. Empty names are rejected (no-op).
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let Some(name) = normalize(name) else {
            return;
        };
        self.entries.insert(name, value.into());
    }

    /// Appends `value` to any existing value for `name` using the
    /// field-specific delimiter, or sets it if absent.
    pub fn add(&mut self, name: &str, value: &str) {
        let Some(name) = normalize(name) else {
            return;
        };
        match self.entries.get_mut(&name) {
            Some(existing) => {
                existing.push_str(delimiter_for(&name));
                existing.push_str(value);
            }
            None => {
                self.entries.insert(name, value.to_owned());
            }
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let name = normalize(name)?;
        self.entries.remove(&name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

impl<N, V> FromIterator<(N, V)> for HeaderSet
where
    N: AsRef<str>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(pairs: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in pairs {
            headers.set(name.as_ref(), value);
        }
        headers
    }
}

impl<'a> IntoIterator for &'a HeaderSet {
    type Item = (&'a String, &'a String);
    type IntoIter = std::collections::btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
