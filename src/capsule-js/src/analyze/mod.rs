//! Pre-execution static analysis: a pluggable rule engine over the AST.
//!
//! The engine walks the tree once in pre-order, dispatching to rule visitors
//! through a visitor map (node type → interested rules). Maps are memoized in
//! a small LRU cache because rebuilding is linear in the rule set while
//! traversal runs per request. The engine itself never prunes; rules decide
//! how deep their own scans go.

pub mod rules;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use capsule_js_common::config::{AnalysisSettings, Severity};
use lru::LruCache;
use tracing::warn;

use crate::syntax::{self, Node, NodeType, ParseError};

pub use rules::RULES;

/// Capacity of the visitor-map cache.
const VISITOR_MAP_CACHE_CAPACITY: usize = 10;

/// Soft latency budget for one analysis pass.
const ANALYSIS_BUDGET_MS: u128 = 50;

/// A visitor callback. Receives the context (for reporting and ancestry) and
/// the node that matched the subscription.
pub type Visitor = fn(&mut RuleContext<'_, '_>, &Node);

/// A static analysis rule.
pub struct Rule {
    /// Stable rule name, used in findings and configuration overrides.
    pub name: &'static str,
    /// Default severity. Built-ins only use `Warn` and `Error` here.
    pub default_severity: Severity,
    /// Human description, surfaced by tooling.
    pub description: &'static str,
    /// Node-type subscriptions and their visitors.
    pub visitors: &'static [(NodeType, Visitor)],
}

/// One analyzer observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Name of the reporting rule.
    pub rule: &'static str,
    /// Effective severity under the active configuration.
    pub severity: Severity,
    /// Human-readable message.
    pub message: String,
    /// 1-based line of the offending node.
    pub line: u32,
    /// 1-based column of the offending node.
    pub column: u32,
    offset: u32,
}

impl Finding {
    /// Render the finding the way it appears in run logs.
    pub fn to_log_line(&self) -> String {
        let level = match self.severity {
            Severity::Error => "error",
            _ => "warning",
        };
        format!(
            "[{level}] {}: {} (line {}, column {})",
            self.rule, self.message, self.line, self.column
        )
    }
}

/// The partitioned result of one analysis pass.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    /// Informational findings.
    pub warnings: Vec<Finding>,
    /// Gating findings.
    pub errors: Vec<Finding>,
    /// Wall-clock duration of the pass.
    pub elapsed_ms: u64,
}

impl AnalysisReport {
    /// Whether any gating finding was produced.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Context handed to visitors.
pub struct RuleContext<'a, 'f> {
    source: &'a str,
    rule: &'static Rule,
    severity_override: Option<Severity>,
    ancestors: &'f [&'a Node],
    findings: &'f mut Vec<Finding>,
}

impl<'a, 'f> RuleContext<'a, 'f> {
    /// Report a finding at the rule's default severity (or its override).
    pub fn report(&mut self, node: &Node, message: impl Into<String>) {
        self.report_with(node, self.rule.default_severity, message);
    }

    /// Report a finding with an explicit base severity. A configured
    /// override still wins; rules with mixed severities use this.
    pub fn report_with(&mut self, node: &Node, base: Severity, message: impl Into<String>) {
        let severity = match self.severity_override {
            Some(Severity::Off) | None => base,
            Some(s) => s,
        };
        let message = message.into();
        let offset = node.span.start;
        // Loop scans and callback scans can surface the same call site.
        if self
            .findings
            .iter()
            .any(|f| f.rule == self.rule.name && f.offset == offset && f.message == message)
        {
            return;
        }
        let (line, column) = syntax::line_col(self.source, offset);
        self.findings.push(Finding {
            rule: self.rule.name,
            severity,
            message,
            line,
            column,
            offset,
        });
    }

    /// The parent of the current node, if any.
    pub fn parent(&self) -> Option<&'a Node> {
        self.ancestors.last().copied()
    }

    /// Whether `candidate` and `node` are the same tree node.
    pub fn same_node(candidate: &Node, node: &Node) -> bool {
        std::ptr::eq(candidate, node)
    }
}

struct VisitorEntry {
    rule: &'static Rule,
    visit: Visitor,
    severity_override: Option<Severity>,
}

type VisitorMap = HashMap<NodeType, Vec<VisitorEntry>>;

fn cache() -> &'static Mutex<LruCache<String, Arc<VisitorMap>>> {
    static CACHE: OnceLock<Mutex<LruCache<String, Arc<VisitorMap>>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        let capacity = NonZeroUsize::new(VISITOR_MAP_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Mutex::new(LruCache::new(capacity))
    })
}

fn cache_key(settings: &AnalysisSettings) -> String {
    let mut key = String::new();
    for (name, severity) in &settings.rules {
        key.push_str(name);
        key.push('=');
        key.push_str(match severity {
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Off => "off",
        });
        key.push(';');
    }
    key
}

fn build_visitor_map(settings: &AnalysisSettings) -> VisitorMap {
    let mut map: VisitorMap = HashMap::new();
    for rule in RULES {
        let severity_override = settings.rules.get(rule.name).copied();
        if severity_override == Some(Severity::Off) {
            continue;
        }
        for (node_type, visit) in rule.visitors {
            map.entry(*node_type).or_default().push(VisitorEntry {
                rule,
                visit: *visit,
                severity_override,
            });
        }
    }
    map
}

fn visitor_map(settings: &AnalysisSettings) -> Arc<VisitorMap> {
    let key = cache_key(settings);
    let mut cache = match cache().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(map) = cache.get(&key) {
        return Arc::clone(map);
    }
    let map = Arc::new(build_visitor_map(settings));
    cache.put(key, Arc::clone(&map));
    map
}

/// Analyze a snippet under the given configuration.
///
/// Returns a parse error only when the source does not parse; the
/// orchestrator normalizes first, so in practice this analyzes the already
/// validated rewrite.
pub fn analyze(source: &str, settings: &AnalysisSettings) -> Result<AnalysisReport, ParseError> {
    let started = Instant::now();
    let program = syntax::parse_program(source)?;
    let map = visitor_map(settings);

    let mut findings = Vec::new();
    let mut ancestors: Vec<&Node> = Vec::new();
    visit_node(&program, source, &map, &mut ancestors, &mut findings);

    let elapsed = started.elapsed();
    if elapsed.as_millis() > ANALYSIS_BUDGET_MS {
        warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            source_len = source.len(),
            "analysis exceeded its latency budget"
        );
    }

    let mut report = AnalysisReport {
        elapsed_ms: elapsed.as_millis() as u64,
        ..AnalysisReport::default()
    };
    for finding in findings {
        match finding.severity {
            Severity::Error => report.errors.push(finding),
            _ => report.warnings.push(finding),
        }
    }
    Ok(report)
}

fn visit_node<'a>(
    node: &'a Node,
    source: &'a str,
    map: &VisitorMap,
    ancestors: &mut Vec<&'a Node>,
    findings: &mut Vec<Finding>,
) {
    if let Some(entries) = map.get(&node.node_type()) {
        for entry in entries {
            let mut cx = RuleContext {
                source,
                rule: entry.rule,
                severity_override: entry.severity_override,
                ancestors: ancestors.as_slice(),
                findings,
            };
            (entry.visit)(&mut cx, node);
        }
    }
    ancestors.push(node);
    node.for_each_child(&mut |child| {
        visit_node(child, source, map, ancestors, findings);
    });
    ancestors.pop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn default_settings() -> AnalysisSettings {
        AnalysisSettings::default()
    }

    fn analyze_default(source: &str) -> AnalysisReport {
        analyze(source, &default_settings()).unwrap()
    }

    #[test]
    fn clean_code_produces_no_findings() {
        let report = analyze_default("const x = await adapters.api.get(1);\nreturn x;");
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);
        assert!(report.errors.is_empty(), "{:?}", report.errors);
    }

    #[test]
    fn empty_source_analyzes_as_empty() {
        let report = analyze_default("");
        assert!(report.warnings.is_empty());
        assert!(report.errors.is_empty());
    }

    #[test]
    fn off_override_removes_the_rule() {
        let mut settings = default_settings();
        settings
            .rules
            .insert("no-infinite-loop".to_string(), Severity::Off);
        let report = analyze("while (true) { console.log('x'); }", &settings).unwrap();
        assert!(report.errors.iter().all(|f| f.rule != "no-infinite-loop"));
    }

    #[test]
    fn severity_override_reclassifies_findings() {
        let mut settings = default_settings();
        settings
            .rules
            .insert("no-nested-loops".to_string(), Severity::Error);
        let report = analyze(
            "for (const a of xs) { for (const b of ys) { use(a, b); } }",
            &settings,
        )
        .unwrap();
        assert!(report.errors.iter().any(|f| f.rule == "no-nested-loops"));
    }

    #[test]
    fn visitor_maps_are_memoized_per_override_set() {
        let mut a = default_settings();
        a.rules = BTreeMap::new();
        let first = visitor_map(&a);
        let second = visitor_map(&a);
        assert!(Arc::ptr_eq(&first, &second));

        a.rules.insert("no-infinite-loop".to_string(), Severity::Off);
        let third = visitor_map(&a);
        assert!(!Arc::ptr_eq(&first, &third));
    }

    #[test]
    fn findings_carry_line_and_column() {
        let report = analyze_default("const a = 1;\nwhile (true) { console.log(a); }");
        let finding = &report.errors[0];
        assert_eq!(finding.rule, "no-infinite-loop");
        assert_eq!(finding.line, 2);
        assert_eq!(finding.column, 1);
        assert!(finding.to_log_line().starts_with("[error] no-infinite-loop:"));
    }
}
