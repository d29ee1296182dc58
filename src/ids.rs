use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

/// External identifier namespaces that can alias a canonical paper id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AliasKind {
    Doi,
    Arxiv,
    CorpusId,
    Mag,
    Acl,
    Pmid,
    Pmcid,
    Url,
    TitleNorm,
}

impl AliasKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AliasKind::Doi => "DOI",
            AliasKind::Arxiv => "ARXIV",
            AliasKind::CorpusId => "CORPUS_ID",
            AliasKind::Mag => "MAG",
            AliasKind::Acl => "ACL",
            AliasKind::Pmid => "PMID",
            AliasKind::Pmcid => "PMCID",
            AliasKind::Url => "URL",
            AliasKind::TitleNorm => "TITLE_NORM",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_uppercase().as_str() {
            "DOI" => Some(AliasKind::Doi),
            "ARXIV" => Some(AliasKind::Arxiv),
            "CORPUS_ID" => Some(AliasKind::CorpusId),
            "MAG" => Some(AliasKind::Mag),
            "ACL" => Some(AliasKind::Acl),
            "PMID" => Some(AliasKind::Pmid),
            "PMCID" => Some(AliasKind::Pmcid),
            "URL" => Some(AliasKind::Url),
            _ => None,
        }
    }

    /// Prefix understood by the upstream Graph API for this kind, if any.
    fn upstream_prefix(&self) -> Option<&'static str> {
        match self {
            AliasKind::Doi => Some("DOI"),
            AliasKind::Arxiv => Some("ARXIV"),
            AliasKind::CorpusId => Some("CorpusId"),
            AliasKind::Mag => Some("MAG"),
            AliasKind::Acl => Some("ACL"),
            AliasKind::Pmid => Some("PMID"),
            AliasKind::Pmcid => Some("PMCID"),
            AliasKind::Url => Some("URL"),
            AliasKind::TitleNorm => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RefParseError {
    #[error("unrecognized paper id `{0}`: expected a 40-hex id or a prefixed external id (DOI:, ARXIV:, CORPUS_ID:, MAG:, ACL:, PMID:, PMCID:, URL:)")]
    Unrecognized(String),
    #[error("missing or invalid value in paper id `{0}`")]
    InvalidValue(String),
}

/// A parsed inbound paper reference: either a canonical 40-hex id or a
/// normalized external alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperRef {
    Canonical(String),
    Alias { kind: AliasKind, value: String },
}

impl PaperRef {
    /// Parse a raw reference. A bare 40-hex token is a canonical id; anything
    /// else must carry a recognized kind prefix.
    pub fn parse(raw: &str) -> Result<Self, RefParseError> {
        let raw = raw.trim();
        if is_canonical_id(raw) {
            return Ok(PaperRef::Canonical(raw.to_ascii_lowercase()));
        }
        if let Some((prefix, rest)) = raw.split_once(':') {
            if let Some(kind) = AliasKind::from_prefix(prefix) {
                let value = normalize(kind, rest)
                    .ok_or_else(|| RefParseError::InvalidValue(raw.to_string()))?;
                return Ok(PaperRef::Alias { kind, value });
            }
        }
        Err(RefParseError::Unrecognized(raw.to_string()))
    }

    /// The reference string forwarded to the upstream API. `TITLE_NORM`
    /// aliases have no upstream form.
    pub fn upstream_ref(&self) -> Option<String> {
        match self {
            PaperRef::Canonical(id) => Some(id.clone()),
            PaperRef::Alias { kind, value } => kind
                .upstream_prefix()
                .map(|p| format!("{}:{}", p, value)),
        }
    }
}

/// True for a 40-character lowercase/uppercase hex token (the canonical
/// paper id convention).
pub fn is_canonical_id(s: &str) -> bool {
    s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

/// Kind-specific, stable normalization of a raw alias value. `None` means
/// the value is malformed for the kind (or empty after normalization).
pub fn normalize(kind: AliasKind, raw: &str) -> Option<String> {
    let raw = raw.trim();
    let normalized = match kind {
        AliasKind::Doi => {
            let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
            let lower = compact.to_lowercase();
            lower.strip_prefix("doi:").unwrap_or(&lower).to_string()
        }
        AliasKind::Arxiv => normalize_arxiv(raw),
        AliasKind::CorpusId => {
            let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.is_empty() {
                return None;
            }
            let stripped = digits.trim_start_matches('0');
            if stripped.is_empty() {
                "0".to_string()
            } else {
                stripped.to_string()
            }
        }
        AliasKind::Mag | AliasKind::Pmid => raw.to_string(),
        AliasKind::Acl | AliasKind::Pmcid => raw.to_ascii_uppercase(),
        AliasKind::Url => normalize_url(raw),
        AliasKind::TitleNorm => normalize_title(raw),
    };
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Strip a trailing `vN` version suffix and any embedded `arxiv:` scheme,
/// lowercasing the archive prefix of old-style ids.
fn normalize_arxiv(raw: &str) -> String {
    let lower = raw.to_lowercase();
    let id = lower.strip_prefix("arxiv:").unwrap_or(&lower);
    match id.rfind('v') {
        Some(pos) if pos > 0 && id[pos + 1..].chars().all(|c| c.is_ascii_digit())
            && !id[pos + 1..].is_empty() =>
        {
            id[..pos].to_string()
        }
        _ => id.to_string(),
    }
}

/// Lowercase scheme and host, drop trailing slash and `utm_*` tracking
/// parameters. Falls back to simple trimming when the input does not parse.
fn normalize_url(raw: &str) -> String {
    let parsed = match url::Url::parse(raw) {
        Ok(u) => u,
        Err(_) => return raw.trim_end_matches('/').to_string(),
    };
    let mut out = parsed.clone();
    let kept: Vec<(String, String)> = parsed
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_"))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        out.set_query(None);
    } else {
        out.query_pairs_mut().clear().extend_pairs(kept);
    }
    // Url::parse already lowercases scheme and host.
    let s = out.to_string();
    s.trim_end_matches('/').to_string()
}

/// NFKC-normalize, lowercase, and strip punctuation and whitespace.
pub fn normalize_title(title: &str) -> String {
    title
        .nfkc()
        .collect::<String>()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}
