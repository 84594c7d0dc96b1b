//! Rule-driven request router.
//!
//! A [`Router`] is an ordered list of [`Route`]s. Each route carries a set of
//! matchers that must *all* accept the request path; a matcher is either a path
//! template or a nested sub-router, which accepts the path when *any* of its own
//! routes does. Compiling a rule tree maps onto this shape directly:
//!
//! * `And(l, r)` attaches the matchers of both sides to the same route;
//! * `Or(l, r)` hangs a sub-router off the route and installs both sides into
//!   it as independent routes (first registered branch wins);
//! * a leaf installs one path template per argument into a sub-router, so
//!   `Path("/a", "/b")` accepts either path.
//!
//! Routers are built once per configuration and then only read; a reload
//! builds a fresh router instead of patching the live one.
use std::{collections::HashSet, fmt};

use async_trait::async_trait;
use axum::{body::Body as AxumBody, http::Request, http::Response};
use regex::Regex;

use crate::{
    core::rule::{MatcherKind, RuleError, RuleNode, RuleResult, check_rule, parse_rule},
    ports::http_handler::{RequestHandler, SharedHandler, not_found},
};

/// Pattern used for `{name}` variables without an explicit regex.
const DEFAULT_VARIABLE_PATTERN: &str = "[^/]+";

/// A compiled path template (`/users/{id:[0-9]+}/posts`).
#[derive(Debug, Clone)]
pub struct PathTemplate {
    template: String,
    regex: Regex,
}

impl PathTemplate {
    /// Compile `template`. `exact` anchors the whole path; otherwise only its start.
    pub fn new(template: &str, exact: bool) -> RuleResult<Self> {
        let invalid = |reason: String| RuleError::InvalidTemplate {
            template: template.to_string(),
            reason,
        };

        let mut pattern = String::from("^");
        let mut names = HashSet::new();
        let mut end = 0;

        for (start, stop) in brace_indices(template).map_err(invalid)? {
            pattern.push_str(&regex::escape(&template[end..start]));

            let inner = &template[start + 1..stop - 1];
            let (name, var_pattern) = match inner.split_once(':') {
                Some((name, var_pattern)) => (name.trim(), var_pattern),
                None => (inner.trim(), DEFAULT_VARIABLE_PATTERN),
            };
            if name.is_empty() {
                return Err(invalid(format!("missing variable name in '{{{inner}}}'")));
            }
            if var_pattern.is_empty() {
                return Err(invalid(format!("missing pattern for variable '{name}'")));
            }
            if !names.insert(name) {
                return Err(invalid(format!("duplicated variable name '{name}'")));
            }

            pattern.push_str("(?:");
            pattern.push_str(var_pattern);
            pattern.push(')');
            end = stop;
        }

        pattern.push_str(&regex::escape(&template[end..]));
        if exact {
            pattern.push('$');
        }

        let regex = Regex::new(&pattern).map_err(|e| invalid(e.to_string()))?;
        Ok(Self {
            template: template.to_string(),
            regex,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }
}

/// Byte offsets of every top-level `{...}` group; nested braces belong to the pattern.
fn brace_indices(template: &str) -> Result<Vec<(usize, usize)>, String> {
    let mut level = 0usize;
    let mut open = 0;
    let mut groups = Vec::new();

    for (i, c) in template.char_indices() {
        match c {
            '{' => {
                level += 1;
                if level == 1 {
                    open = i;
                }
            }
            '}' => {
                if level == 0 {
                    return Err(format!("unbalanced '}}' at offset {i}"));
                }
                level -= 1;
                if level == 0 {
                    groups.push((open, i + 1));
                }
            }
            _ => {}
        }
    }

    if level != 0 {
        return Err("unbalanced braces".to_string());
    }
    Ok(groups)
}

#[derive(Clone)]
enum RouteMatcher {
    Template(PathTemplate),
    Subrouter(Router),
}

impl RouteMatcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            RouteMatcher::Template(template) => template.matches(path),
            RouteMatcher::Subrouter(router) => router.find(path).is_some(),
        }
    }
}

/// One entry of a [`Router`]: conjunctive matchers plus an optional handler.
#[derive(Clone, Default)]
pub struct Route {
    rule: Option<String>,
    priority: usize,
    handler: Option<SharedHandler>,
    matchers: Vec<RouteMatcher>,
}

impl Route {
    fn bound(rule: &str, priority: usize, handler: SharedHandler) -> Self {
        Self {
            rule: Some(rule.to_string()),
            priority,
            handler: Some(handler),
            matchers: Vec::new(),
        }
    }

    /// Rule text this route was compiled from (top-level routes only).
    pub fn rule(&self) -> Option<&str> {
        self.rule.as_deref()
    }

    pub fn priority(&self) -> usize {
        self.priority
    }

    pub fn handler(&self) -> Option<&SharedHandler> {
        self.handler.as_ref()
    }

    /// True when every attached matcher accepts `path`.
    pub fn matches(&self, path: &str) -> bool {
        self.matchers.iter().all(|m| m.matches(path))
    }

    /// Register one template per argument on a sub-router derived from this route.
    fn add_templates(&mut self, templates: &[String], exact: bool) -> RuleResult<()> {
        let mut sub = Router::new();
        for template in templates {
            let compiled = PathTemplate::new(template, exact)?;
            sub.routes.push(Route {
                matchers: vec![RouteMatcher::Template(compiled)],
                ..Route::default()
            });
        }
        self.matchers.push(RouteMatcher::Subrouter(sub));
        Ok(())
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("rule", &self.rule)
            .field("priority", &self.priority)
            .field("matchers", &self.matchers.len())
            .finish()
    }
}

/// Install `paths` as exact-path matchers on `route`.
fn path(route: &mut Route, paths: &[String]) -> RuleResult<()> {
    route.add_templates(paths, true)
}

/// Install `prefixes` as path-prefix matchers on `route`.
fn path_prefix(route: &mut Route, prefixes: &[String]) -> RuleResult<()> {
    route.add_templates(prefixes, false)
}

fn install_matcher(route: &mut Route, kind: MatcherKind, args: &[String]) -> RuleResult<()> {
    check_rule(kind, args)?;
    match kind {
        MatcherKind::Path => path(route, args),
        MatcherKind::PathPrefix => path_prefix(route, args),
    }
}

/// Attach `node` to `router` as one or more new routes.
fn add_rule_on_router(router: &mut Router, node: &RuleNode) -> RuleResult<()> {
    match node {
        RuleNode::And(left, right) => {
            let mut route = Route::default();
            add_rule_on_route(&mut route, left)?;
            add_rule_on_route(&mut route, right)?;
            router.routes.push(route);
        }
        RuleNode::Or(left, right) => {
            add_rule_on_router(router, left)?;
            add_rule_on_router(router, right)?;
        }
        RuleNode::Matcher { kind, args } => {
            let mut route = Route::default();
            install_matcher(&mut route, *kind, args)?;
            router.routes.push(route);
        }
    }
    Ok(())
}

/// Attach `node` to an existing route (conjunctively).
fn add_rule_on_route(route: &mut Route, node: &RuleNode) -> RuleResult<()> {
    match node {
        RuleNode::And(left, right) => {
            add_rule_on_route(route, left)?;
            add_rule_on_route(route, right)
        }
        RuleNode::Or(left, right) => {
            let mut sub = Router::new();
            add_rule_on_router(&mut sub, left)?;
            add_rule_on_router(&mut sub, right)?;
            route.matchers.push(RouteMatcher::Subrouter(sub));
            Ok(())
        }
        RuleNode::Matcher { kind, args } => install_matcher(route, *kind, args),
    }
}

/// Ordered routing table.
///
/// Top-level routes are kept sorted by descending priority; routes with equal
/// priority keep their registration order.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `rule` and register a route dispatching to `handler`.
    ///
    /// A `priority` of zero defaults to the length of the rule text. On error the
    /// router is left untouched.
    pub fn add_route(
        &mut self,
        rule: &str,
        priority: usize,
        handler: SharedHandler,
    ) -> RuleResult<()> {
        let tree = parse_rule(rule)?;
        let priority = if priority == 0 { rule.len() } else { priority };

        let mut route = Route::bound(rule, priority, handler);
        add_rule_on_route(&mut route, &tree)?;

        let index = self
            .routes
            .iter()
            .position(|r| r.priority < priority)
            .unwrap_or(self.routes.len());
        self.routes.insert(index, route);

        tracing::debug!(rule, priority, "Installed route");
        Ok(())
    }

    /// First route accepting `path`, in priority order.
    pub fn find(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Handler of the first route accepting `path`.
    pub fn lookup(&self, path: &str) -> Option<SharedHandler> {
        self.find(path).and_then(|route| route.handler.clone())
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.routes.iter()).finish()
    }
}

#[async_trait]
impl RequestHandler for Router {
    async fn handle(&self, req: Request<AxumBody>) -> Response<AxumBody> {
        match self.lookup(req.uri().path()) {
            Some(handler) => handler.handle(req).await,
            None => not_found(),
        }
    }
}
