//! Prompt template registry.
//!
//! Templates are named, role-scoped prompt bodies with `{placeholder}`
//! substitution. Two roles exist:
//!
//! | Role | Variables |
//! |------|-----------|
//! | [`Role::Single`] | `document_text`, `question`, `category`, `document_name` |
//! | [`Role::Aggregate`] | `question`, `answers`, `answer_count` |
//!
//! `{{` and `}}` render as literal braces. Placeholders are checked when a
//! template is registered, so a typo in a template fails at startup rather
//! than in the middle of a run.
//!
//! The registry starts from the built-in templates and can be extended from
//! a directory laid out as:
//!
//! ```text
//! <dir>/single/<name>.txt
//! <dir>/aggregate/<name>.txt
//! ```
//!
//! A file template with the same name as a built-in replaces it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

use crate::error::{QaError, Result};

/// Which stage a template is rendered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// One document, one question (map stage).
    Single,
    /// Many per-document answers, one question (reduce stage).
    Aggregate,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Single, Role::Aggregate];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Single => "single",
            Role::Aggregate => "aggregate",
        }
    }

    /// Placeholders a template of this role may reference.
    pub fn variables(&self) -> &'static [&'static str] {
        match self {
            Role::Single => &["document_text", "question", "category", "document_name"],
            Role::Aggregate => &["question", "answers", "answer_count"],
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "single" => Ok(Role::Single),
            "aggregate" => Ok(Role::Aggregate),
            other => Err(format!(
                "unknown template role '{}': expected single or aggregate",
                other
            )),
        }
    }
}

/// Where a template came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    Builtin,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A parsed, validated prompt template.
#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    role: Role,
    source: TemplateSource,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `body` and check its placeholders against `role`.
    pub fn new(
        name: impl Into<String>,
        role: Role,
        body: &str,
        source: TemplateSource,
    ) -> Result<Self> {
        let name = name.into();
        let segments = parse_body(body).map_err(|message| QaError::TemplateInvalid {
            name: name.clone(),
            message,
        })?;

        for seg in &segments {
            if let Segment::Var(var) = seg {
                if !role.variables().contains(&var.as_str()) {
                    return Err(QaError::TemplateInvalid {
                        name,
                        message: format!(
                            "placeholder {{{}}} is not available to {} templates (allowed: {})",
                            var,
                            role,
                            role.variables().join(", ")
                        ),
                    });
                }
            }
        }

        Ok(Self {
            name,
            role,
            source,
            segments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn source(&self) -> &TemplateSource {
        &self.source
    }

    /// Substitute variables. Missing variables render as an empty string.
    pub fn render(&self, vars: &Variables) -> String {
        let mut out = String::new();
        for seg in &self.segments {
            match seg {
                Segment::Text(t) => out.push_str(t),
                Segment::Var(v) => out.push_str(vars.get(v).unwrap_or("")),
            }
        }
        out
    }
}

/// Values substituted into a template at render time.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: HashMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<String>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }
}

fn parse_body(body: &str) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                text.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                text.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err(format!("unclosed placeholder '{{{}'", name));
                }
                if !is_identifier(&name) {
                    return Err(format!(
                        "'{{{}}}' is not a placeholder; write literal braces as {{{{ and }}}}",
                        name
                    ));
                }
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Var(name));
            }
            other => text.push(other),
        }
    }

    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    Ok(segments)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Registry of templates for both roles.
///
/// # Example
///
/// ```rust
/// use mapreduce_qa::templates::{Role, TemplateRegistry, Variables};
///
/// let registry = TemplateRegistry::with_builtins();
/// let prompt = registry
///     .render(
///         Role::Single,
///         "baseline",
///         &Variables::new()
///             .set("document_text", "本文")
///             .set("question", "定義は？"),
///     )
///     .unwrap();
/// assert!(prompt.contains("定義は？"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    single: BTreeMap<String, Template>,
    aggregate: BTreeMap<String, Template>,
}

impl TemplateRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding the built-in templates.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (role, name, body) in BUILTINS {
            // Built-ins are covered by tests; a parse failure here is a programming error.
            if let Ok(t) = Template::new(*name, *role, body, TemplateSource::Builtin) {
                registry.insert(t);
            }
        }
        registry
    }

    /// Built-ins plus every `*.txt` under `<dir>/single` and `<dir>/aggregate`.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut registry = Self::with_builtins();
        for role in Role::ALL {
            let role_dir = dir.join(role.as_str());
            if !role_dir.is_dir() {
                continue;
            }
            let entries =
                std::fs::read_dir(&role_dir).map_err(|e| QaError::storage(&role_dir, e))?;
            let mut paths: Vec<PathBuf> = entries
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|x| x == "txt").unwrap_or(false))
                .collect();
            paths.sort();

            for path in paths {
                let name = match path.file_stem() {
                    Some(stem) => stem.to_string_lossy().to_string(),
                    None => continue,
                };
                let body =
                    std::fs::read_to_string(&path).map_err(|e| QaError::storage(&path, e))?;
                let template = Template::new(name, role, &body, TemplateSource::File(path))?;
                debug!(role = %role, name = template.name(), "loaded template from disk");
                registry.insert(template);
            }
        }
        Ok(registry)
    }

    /// Register a template, replacing any template with the same role and name.
    pub fn register(&mut self, template: Template) {
        self.insert(template);
    }

    fn insert(&mut self, template: Template) {
        let map = self.map_mut(template.role());
        map.insert(template.name().to_string(), template);
    }

    fn map(&self, role: Role) -> &BTreeMap<String, Template> {
        match role {
            Role::Single => &self.single,
            Role::Aggregate => &self.aggregate,
        }
    }

    fn map_mut(&mut self, role: Role) -> &mut BTreeMap<String, Template> {
        match role {
            Role::Single => &mut self.single,
            Role::Aggregate => &mut self.aggregate,
        }
    }

    pub fn find(&self, role: Role, name: &str) -> Option<&Template> {
        self.map(role).get(name)
    }

    /// Look up a template or fail with [`QaError::UnknownTemplate`].
    pub fn ensure(&self, role: Role, name: &str) -> Result<&Template> {
        self.find(role, name).ok_or_else(|| QaError::UnknownTemplate {
            role,
            name: name.to_string(),
            available: self.list_templates(role).map(str::to_string).collect(),
        })
    }

    /// Names registered for `role`, in sorted order. Each call starts a fresh iteration.
    pub fn list_templates(&self, role: Role) -> impl Iterator<Item = &str> + '_ {
        self.map(role).keys().map(String::as_str)
    }

    pub fn render(&self, role: Role, name: &str, vars: &Variables) -> Result<String> {
        Ok(self.ensure(role, name)?.render(vars))
    }

    pub fn len(&self) -> usize {
        self.single.len() + self.aggregate.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

const BUILTINS: &[(Role, &str, &str)] = &[
    (Role::Single, "baseline", BASELINE),
    (Role::Single, "sandwich", SANDWICH),
    (Role::Single, "structured", STRUCTURED),
    (Role::Aggregate, "consensus", CONSENSUS),
    (Role::Aggregate, "compare", COMPARE),
];

const BASELINE: &str = "あなたは行政文書の内容に基づいて質問に回答するアシスタントです。
以下の文書（分類: {category} / 文書名: {document_name}）だけを根拠として、質問に回答してください。
文書に記載がない場合は「文書に記載がありません」と回答してください。

---

{document_text}

---

質問: {question}

回答には、根拠となる記述の箇所（章・条・見出しなど）を出典として併記してください。
";

const SANDWICH: &str = "以下の質問に、後に続く行政文書（分類: {category} / 文書名: {document_name}）の内容だけを根拠に回答してください。

質問: {question}

---

{document_text}

---

改めて質問です: {question}

文書に記載がある場合は、該当箇所を引用しながら具体的に回答してください。
記載がない場合は「文書に記載がありません」と回答してください。
";

const STRUCTURED: &str = "あなたは行政文書の内容を構造化して回答するアシスタントです。
以下の文書（分類: {category} / 文書名: {document_name}）だけを根拠にしてください。

---

{document_text}

---

質問: {question}

次の形式の JSON オブジェクトのみを出力してください。説明文は不要です。
{{
  \"answer\": \"質問への回答\",
  \"found\": true,
  \"sources\": [\"根拠となる章・条・見出し\"],
  \"notes\": \"補足事項（なければ空文字）\"
}}
";

const CONSENSUS: &str = "以下は複数の行政文書から得られた回答です。これらを統合して、最も適切で包括的な回答を作成してください。

元の質問: 「{question}」

各文書からの回答（{answer_count} 件）:
{answers}

上記の回答を分析し、以下の形式で統合回答を作成してください：

## 統合回答

[最も適切で包括的な回答]

## 根拠・出典

[どの文書のどの部分に基づいているかを明記]

## 注意事項

[制約事項や追加で確認が必要な事項があれば記載]
";

const COMPARE: &str = "以下は同じ質問に対して複数の行政文書からそれぞれ得られた回答です（{answer_count} 件）。

質問: 「{question}」

{answers}

文書ごとの回答の共通点と相違点を整理してください。
「文書に記載がありません」とされた文書は除外し、記載のあった文書のみを比較してください。
最後に、質問に対する結論を簡潔にまとめてください。
";
