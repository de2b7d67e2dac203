//! 提示词模板
//!
//! 模板正文使用 `{{name}}` 占位符；`required` 中列出的变量缺失时渲染失败，其余缺失变量渲染为空。
//! 内置 `agent_step` 与 `planning` 两个模板，也可从目录加载 `*.toml`（`[template] id, body, required`）覆盖。

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::Deserialize;

use crate::core::error::{HiveError, Result};

const AGENT_STEP: &str = "## Goal
{{goal}}

## Your Step
You are agent `{{agent_id}}` executing step `{{step_id}}`.

{{input}}

## Results From Previous Steps
{{history}}

## Relevant Memory
{{memories}}";

const PLANNING: &str = "## Task
Plan the steps needed to solve the task below with the available agents.
The current date is {{current_date}}. Convert relative time expressions to specific dates.

## Output Format
1. Output both <PLANNING_TAG> and <FINAL_ANSWER_TAG> sections.
2. Inside <PLANNING_TAG> output one JSON object with \"steps\" and \"dag\".
3. Each step has \"input\" and \"id\"; \"id\" is an agent id from Available Agents.
4. \"dag\" lists step ids in execution order; parallel steps are grouped in nested arrays.
5. If no further planning is needed, leave <PLANNING_TAG> empty and explain in <FINAL_ANSWER_TAG>.

## Available Agents
{{tool_list}}

## Task
{{task}}";

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("valid placeholder regex")
    })
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PromptTemplate {
    pub id: String,
    pub body: String,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateToml {
    template: PromptTemplate,
}

impl PromptTemplate {
    pub fn new(id: impl Into<String>, body: impl Into<String>, required: &[&str]) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            required: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// 正文中出现的占位符（去重，按出现顺序）
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for cap in placeholder_re().captures_iter(&self.body) {
            let name = cap[1].to_string();
            if !seen.contains(&name) {
                seen.push(name);
            }
        }
        seen
    }

    /// 单遍替换；变量值中的 `{{..}}` 不会再次展开
    pub fn render(&self, vars: &BTreeMap<String, String>) -> Result<String> {
        if let Some(missing) = self.required.iter().find(|r| !vars.contains_key(*r)) {
            return Err(HiveError::Render {
                template: self.id.clone(),
                variable: missing.clone(),
            });
        }
        let out = placeholder_re().replace_all(&self.body, |caps: &Captures| {
            vars.get(&caps[1]).cloned().unwrap_or_default()
        });
        Ok(out.into_owned())
    }
}

/// 模板注册表
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, PromptTemplate>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(PromptTemplate::new(
            "agent_step",
            AGENT_STEP,
            &["step_id", "agent_id", "input"],
        ));
        reg.register(PromptTemplate::new(
            "planning",
            PLANNING,
            &["current_date", "tool_list", "task"],
        ));
        reg
    }

    /// 同 ID 覆盖
    pub fn register(&mut self, template: PromptTemplate) {
        self.templates.insert(template.id.clone(), template);
    }

    pub fn get(&self, id: &str) -> Option<&PromptTemplate> {
        self.templates.get(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// 加载目录下所有 *.toml 模板，返回加载数量
    pub fn load_dir(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let mut paths: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("toml"))
            .collect();
        paths.sort();

        for path in &paths {
            let text = std::fs::read_to_string(path)?;
            let parsed: TemplateToml = toml::from_str(&text).map_err(|e| {
                HiveError::Config(format!("invalid template file {}: {}", path.display(), e))
            })?;
            tracing::debug!(template = %parsed.template.id, path = %path.display(), "Loaded prompt template");
            self.register(parsed.template);
        }
        Ok(paths.len())
    }
}
