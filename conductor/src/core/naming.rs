//! Project naming heuristics.

use serde::{Deserialize, Serialize};

/// File naming proposed for the deliverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectNaming {
    pub project_name: String,
    pub main_file: String,
    pub test_file: String,
    #[serde(default)]
    pub description: String,
}

struct Theme {
    keywords: &'static [&'static str],
    project_name: &'static str,
    stem: &'static str,
    description: &'static str,
}

const THEMES: &[Theme] = &[
    Theme {
        keywords: &["string", "text", "字符串"],
        project_name: "string_utils",
        stem: "string_operations",
        description: "String manipulation utilities",
    },
    Theme {
        keywords: &["math", "calculat", "数学", "计算"],
        project_name: "math_utils",
        stem: "math_calculator",
        description: "Math calculation library",
    },
    Theme {
        keywords: &["file", "文件"],
        project_name: "file_utils",
        stem: "file_processor",
        description: "File processing utilities",
    },
    Theme {
        keywords: &["network", "http", "网络"],
        project_name: "network_utils",
        stem: "network_client",
        description: "Network utilities",
    },
];

/// Keyword-based naming used when the reasoner's proposal is unusable.
///
/// Themes are checked in order; the first keyword hit wins.
pub fn default_naming(task: &str, extension: &str) -> ProjectNaming {
    let lowered = task.to_lowercase();
    let (project_name, stem, description) = THEMES
        .iter()
        .find(|theme| theme.keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|theme| (theme.project_name, theme.stem, theme.description))
        .unwrap_or(("custom_utils", "main_module", "Custom utility library"));
    ProjectNaming {
        project_name: project_name.to_string(),
        main_file: format!("{stem}.{extension}"),
        test_file: format!("test_{stem}.{extension}"),
        description: description.to_string(),
    }
}

/// Snake-case identifier safe for file and directory names.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = true;
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

/// True if `name` is a bare file name (no directories) ending in `.extension`.
pub fn is_plain_file_name(name: &str, extension: &str) -> bool {
    let suffix = format!(".{extension}");
    !name.contains(['/', '\\'])
        && name != suffix
        && name.ends_with(&suffix)
        && !name.starts_with('.')
}
