//! Header-name tables: compact forms, contact-like headers and
//! non-coalescing headers.

/// Compact single-letter forms and their long names (RFC 3261 Section 7.3.3
/// plus the extension forms in common use).
static COMPACT_FORMS: &[(char, &str)] = &[
    ('b', "Referred-By"),
    ('c', "Content-Type"),
    ('e', "Content-Encoding"),
    ('f', "From"),
    ('i', "Call-ID"),
    ('k', "Supported"),
    ('l', "Content-Length"),
    ('m', "Contact"),
    ('o', "Event"),
    ('r', "Refer-To"),
    ('s', "Subject"),
    ('t', "To"),
    ('u', "Allow-Events"),
    ('v', "Via"),
];

/// Headers whose values share the name-addr / addr-spec grammar and are
/// normalized to `"display" <uri>;params` during parsing.
static CONTACT_LIKE: &[&str] = &["contact", "from", "to", "route", "record-route", "reply-to"];

/// Headers whose multiple values must never be comma-merged or split.
/// Challenge headers carry commas inside a single value, and Date carries
/// one after the weekday.
static NON_COALESCING: &[&str] = &[
    "www-authenticate",
    "proxy-authenticate",
    "authorization",
    "proxy-authorization",
    "date",
];

/// Expands a compact (single-letter) header form to its long name.
///
/// Returns `None` for letters without a registered compact form; the
/// parser then keeps the single-letter name as-is.
pub fn expand_compact_form(letter: char) -> Option<&'static str> {
    let lower = letter.to_ascii_lowercase();
    COMPACT_FORMS
        .iter()
        .find(|(c, _)| *c == lower)
        .map(|(_, name)| *name)
}

/// Returns whether `name` is a contact-like header (Contact, From, To,
/// Route, Record-Route, Reply-To).
pub fn is_contact_like_header(name: &str) -> bool {
    CONTACT_LIKE.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Returns whether `name` must keep its entries separate instead of being
/// split on commas (e.g. WWW-Authenticate).
pub fn is_non_coalescing_header(name: &str) -> bool {
    NON_COALESCING.iter().any(|h| h.eq_ignore_ascii_case(name))
}
