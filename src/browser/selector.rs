//! Typed element selectors
//!
//! The chat UI is addressed by CSS plus a few text-based matches (remembered
//! account rows, "Next" buttons, the `finished` sentinel). CDP only speaks
//! `querySelector`, so text matching runs in a small resolver script that
//! the chromium driver injects with each query.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Selector {
    Css {
        css: String,
    },
    /// Elements matching `css` whose trimmed text equals `text` (`exact`),
    /// or contains it case-insensitively. The deepest match wins.
    Text {
        css: String,
        text: String,
        exact: bool,
    },
    /// First alternative that resolves
    Any {
        options: Vec<Selector>,
    },
}

impl Selector {
    pub fn css(css: impl Into<String>) -> Self {
        Selector::Css { css: css.into() }
    }

    /// Any element whose visible text is exactly `text`
    pub fn text_is(text: impl Into<String>) -> Self {
        Selector::Text {
            css: "*".to_string(),
            text: text.into(),
            exact: true,
        }
    }

    pub fn has_text(css: impl Into<String>, text: impl Into<String>) -> Self {
        Selector::Text {
            css: css.into(),
            text: text.into(),
            exact: false,
        }
    }

    pub fn any(options: impl IntoIterator<Item = Selector>) -> Self {
        Selector::Any {
            options: options.into_iter().collect(),
        }
    }

    /// Leaf selectors, flattening `Any`
    pub fn alternatives(&self) -> Vec<&Selector> {
        match self {
            Selector::Any { options } => options.iter().flat_map(|o| o.alternatives()).collect(),
            leaf => vec![leaf],
        }
    }

    /// JS expression evaluating to the first matching element or `null`
    pub(crate) fn resolve_expression(&self) -> String {
        // Serializing a plain enum of strings cannot fail
        let query = serde_json::to_string(self).unwrap_or_else(|_| "null".to_string());
        format!("({RESOLVER_JS})({query})")
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::Css { css } => write!(f, "{css}"),
            Selector::Text {
                css,
                text,
                exact: true,
            } => write!(f, "{css}:text-is({text:?})"),
            Selector::Text {
                css,
                text,
                exact: false,
            } => write!(f, "{css}:has-text({text:?})"),
            Selector::Any { options } => {
                let parts: Vec<String> = options.iter().map(|o| o.to_string()).collect();
                write!(f, "{}", parts.join(", "))
            }
        }
    }
}

const RESOLVER_JS: &str = r#"function resolve(query) {
    if (!query) return null;
    if (query.kind === 'any') {
        for (const option of query.options) {
            const found = resolve(option);
            if (found) return found;
        }
        return null;
    }
    const nodes = Array.from(document.querySelectorAll(query.css));
    if (query.kind === 'css') return nodes[0] || null;
    const wanted = query.exact ? query.text : query.text.toLowerCase();
    const hits = nodes.filter((node) => {
        const text = (node.textContent || '').trim();
        return query.exact ? text === wanted : text.toLowerCase().includes(wanted);
    });
    const deepest = hits.filter((node) => !hits.some((other) => other !== node && node.contains(other)));
    return deepest[0] || null;
}"#;
