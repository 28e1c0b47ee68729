//! 模式检测
//!
//! 在单个会话的有序事件上识别重复出现的工具使用序列和异常的重试循环。
//! 输入只取 after-tool 事件的工具名序列；复杂度为
//! O(工具事件数 × 模板数)，除事件表和模式表外不碰任何外部状态。

use crate::error::Result;
use crate::store::{EventStore, PatternMatch};
use crate::types::{DetectedPattern, Event};

/// 模板 token：字面工具名，或"与前一个实际值相同"的通配
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateToken {
    Tool(&'static str),
    /// 通配：等于窗口内紧邻的前一个工具名
    SamePrev,
}

/// 模式模板（定长 token 序列，置信度为模板固定值）
#[derive(Debug, Clone, Copy)]
pub struct PatternTemplate {
    pub name: &'static str,
    pub description: &'static str,
    pub tokens: &'static [TemplateToken],
    pub confidence: f64,
}

use TemplateToken::{SamePrev, Tool};

/// 内置模板表
pub const TEMPLATES: &[PatternTemplate] = &[
    PatternTemplate {
        name: "read-before-edit",
        description: "Read a file immediately before editing it",
        tokens: &[Tool("Read"), Tool("Edit")],
        confidence: 0.85,
    },
    PatternTemplate {
        name: "search-then-read",
        description: "Search results followed by reading a file",
        tokens: &[Tool("Grep"), Tool("Read")],
        confidence: 0.75,
    },
    PatternTemplate {
        name: "edit-then-verify",
        description: "Edit followed by a shell command, usually verification",
        tokens: &[Tool("Edit"), Tool("Bash")],
        confidence: 0.7,
    },
    PatternTemplate {
        name: "double-edit",
        description: "Edit invoked twice in a row",
        tokens: &[Tool("Edit"), SamePrev],
        confidence: 0.6,
    },
];

/// 构成重试循环的最小连续次数
pub const RETRY_MIN_RUN: usize = 3;

/// 重试循环的固定置信度
pub const RETRY_CONFIDENCE: f64 = 0.9;

const TYPE_SEQUENCE: &str = "tool-sequence";
const TYPE_RETRY: &str = "tool-retry";

/// 工具结果事件的类型标签
const AFTER_TOOL_EVENT: &str = "after-tool";

/// 模式检测器
pub struct PatternDetector<'a> {
    store: &'a EventStore,
}

impl<'a> PatternDetector<'a> {
    pub fn new(store: &'a EventStore) -> Self {
        Self { store }
    }

    /// 分析一个会话，返回本次调用新计入的模式记录（已有行累加，不替换）
    pub fn analyze(&self, source_app: &str, session_id: &str) -> Result<Vec<DetectedPattern>> {
        let events = self.store.by_session(source_app, session_id)?;
        let tools = tool_sequence(&events);

        let mut results = Vec::new();

        // 模板匹配
        for template in TEMPLATES {
            if let Some(m) = match_template(template, &tools) {
                results.push(self.store.upsert_pattern(source_app, session_id, &m)?);
            }
        }

        // 重试循环检测
        for m in retry_streaks(&tools) {
            results.push(self.store.upsert_pattern(source_app, session_id, &m)?);
        }

        tracing::debug!(
            "模式分析完成: app={}, session={}, tools={}, matches={}",
            source_app,
            session_id,
            tools.len(),
            results.len()
        );

        Ok(results)
    }
}

/// 输入归约：只保留工具结果事件，按序取出工具名
fn tool_sequence(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter(|e| e.event_type == AFTER_TOOL_EVENT)
        .filter_map(|e| {
            e.payload
                .get("tool")
                .or_else(|| e.payload.get("tool_name"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        })
        .collect()
}

/// 在工具名序列上滑动模板长度的窗口，统计命中次数
///
/// 字面 token 要求相等；通配 token 要求等于窗口内前一个实际值。
fn match_template(template: &PatternTemplate, tools: &[String]) -> Option<PatternMatch> {
    let len = template.tokens.len();
    if len == 0 || tools.len() < len {
        return None;
    }

    let mut occurrences = 0i64;
    let mut sample: Option<Vec<String>> = None;

    for window in tools.windows(len) {
        let matched = template.tokens.iter().enumerate().all(|(i, token)| match token {
            Tool(name) => window[i] == *name,
            // 模板构造上 SamePrev 不会出现在首位
            SamePrev => i > 0 && window[i] == window[i - 1],
        });

        if matched {
            occurrences += 1;
            if sample.is_none() {
                sample = Some(window.to_vec());
            }
        }
    }

    if occurrences == 0 {
        return None;
    }

    Some(PatternMatch {
        pattern_type: TYPE_SEQUENCE.to_string(),
        pattern_name: template.name.to_string(),
        description: template.description.to_string(),
        occurrences,
        sample: sample.unwrap_or_default(),
        confidence: template.confidence,
    })
}

/// 扫描 >= RETRY_MIN_RUN 的同名工具极大连续段
///
/// 每段产生一个 tool-retry 命中，计数取"段长减一"（首次之外的重复次数）。
fn retry_streaks(tools: &[String]) -> Vec<PatternMatch> {
    let mut matches = Vec::new();
    let mut i = 0;

    while i < tools.len() {
        let mut run = 1;
        while i + run < tools.len() && tools[i + run] == tools[i] {
            run += 1;
        }

        if run >= RETRY_MIN_RUN {
            let tool = &tools[i];
            matches.push(PatternMatch {
                pattern_type: TYPE_RETRY.to_string(),
                pattern_name: format!("{}-retry", tool.to_lowercase()),
                description: format!("Tool '{}' invoked {} times in a row", tool, run),
                occurrences: (run - 1) as i64,
                sample: tools[i..i + run].to_vec(),
                confidence: RETRY_CONFIDENCE,
            });
        }

        i += run;
    }

    matches
}
