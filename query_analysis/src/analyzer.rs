//! Locates the fact table in a SELECT and extracts cacheable conjunct
//! bundles from its WHERE clause and join graph.

use crate::{
    FactTableMissingSnafu, NotASelectSnafu, ParseSnafu, Result, SetOperationSnafu,
    StatementCountSnafu, WithClauseSnafu,
};
use snafu::ResultExt;
use sqlparser::{
    ast::{
        BinaryOperator, Expr, JoinConstraint, JoinOperator, Query, Select, SetExpr, Statement,
        TableFactor,
    },
    dialect::GenericDialect,
    parser::Parser,
};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tracing::debug;

/// One table occurrence in the FROM clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableOccurrence {
    /// Base table name.
    pub name: String,
    /// Effective alias: the declared alias, or the table name if none.
    pub alias: String,
}

impl TableOccurrence {
    /// Render this occurrence for a FROM clause.
    pub fn render_from(&self) -> String {
        if self.alias == self.name {
            self.name.clone()
        } else {
            format!("{} AS {}", self.name, self.alias)
        }
    }
}

/// How a bundle restricts the fact table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundleKind {
    /// Conditions referencing only fact-table columns (directly or as the
    /// outer expression of a subquery membership test).
    FactLocal,
    /// Conditions on a joined dimension, collapsed into a membership test
    /// over the join path; `hops` is the path length to the fact table.
    Dimension {
        /// Join hops between the dimension and the fact table.
        hops: usize,
    },
}

/// One independently cacheable predicate over the fact table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConjunctBundle {
    /// Restriction kind.
    pub kind: BundleKind,
    /// Self-contained SQL predicate referencing only the fact table alias.
    pub predicate_sql: String,
    /// Aliases of the tables the original conditions referenced.
    pub source_tables: BTreeSet<String>,
}

/// Analysis result: the fact table and its cacheable conjunct bundles.
///
/// Bundles restrict fact *rows*, so each bundle restricts the value set of
/// every partition key column; the choice of key happens at variant
/// generation time.
#[derive(Debug, Clone)]
pub struct AnalyzedQuery {
    /// The fact table occurrence.
    pub fact: TableOccurrence,
    /// Cacheable bundles, in order of first appearance.
    pub bundles: Vec<ConjunctBundle>,
}

/// Equality join edge between two table occurrences.
#[derive(Debug, Clone)]
struct JoinEdge {
    left: usize,
    left_col: String,
    right: usize,
    right_col: String,
}

/// Analyse one SELECT statement against `fact_table`.
pub fn analyze(sql: &str, fact_table: &str) -> Result<AnalyzedQuery> {
    let query = parse_single_select(sql)?;
    let select = single_select_body(&query)?;

    // Table occurrences: the relation of every FROM item plus every join
    // relation. Only inner joins contribute edges; other join types leave
    // their tables visible but unreachable for collapsing.
    let mut occurrences: Vec<TableOccurrence> = Vec::new();
    let mut inner_joined: Vec<bool> = Vec::new();
    let mut on_conjuncts: Vec<Expr> = Vec::new();

    for twj in &select.from {
        register(&twj.relation, true, &mut occurrences, &mut inner_joined);
        for join in &twj.joins {
            let (is_inner, constraint) = match &join.join_operator {
                JoinOperator::Inner(c) => (true, Some(c)),
                JoinOperator::LeftOuter(c)
                | JoinOperator::RightOuter(c)
                | JoinOperator::FullOuter(c) => (false, Some(c)),
                _ => (false, None),
            };
            register(&join.relation, is_inner, &mut occurrences, &mut inner_joined);
            if let (true, Some(JoinConstraint::On(expr))) = (is_inner, constraint) {
                flatten_and(expr, &mut on_conjuncts);
            }
        }
    }

    let alias_map: HashMap<&str, usize> = occurrences
        .iter()
        .enumerate()
        .map(|(i, occ)| (occ.alias.as_str(), i))
        .collect();

    let fact_idx = occurrences
        .iter()
        .position(|occ| occ.name == fact_table || occ.alias == fact_table)
        .ok_or_else(|| {
            FactTableMissingSnafu {
                table: fact_table.to_string(),
            }
            .build()
        })?;

    // Top-level WHERE conjuncts.
    let mut where_conjuncts = Vec::new();
    if let Some(selection) = &select.selection {
        if is_disjunction(selection) {
            return crate::NotConjunctiveSnafu.fail();
        }
        flatten_and(selection, &mut where_conjuncts);
    }

    let mut edges: Vec<JoinEdge> = Vec::new();
    let mut conditions: Vec<(Expr, Refs)> = Vec::new();

    for conjunct in where_conjuncts.into_iter().chain(on_conjuncts) {
        if let Some(edge) = as_join_edge(&conjunct, &alias_map) {
            edges.push(edge);
            continue;
        }
        let refs = collect_refs(&conjunct, &alias_map);
        conditions.push((conjunct, refs));
    }

    // Classify conditions: fact-local bundles keep their own position;
    // dimension conditions gather into one bundle per dimension alias,
    // anchored at the first condition's position.
    let single_table = occurrences.len() == 1;
    let mut builders: Vec<BundleBuilder> = Vec::new();
    let mut dim_slot: HashMap<usize, usize> = HashMap::new();

    for (expr, refs) in conditions {
        let target = match refs.classify(fact_idx, single_table) {
            Classification::FactLocal => {
                builders.push(BundleBuilder::fact_local(expr));
                continue;
            }
            Classification::Dimension(idx) => idx,
            Classification::Attribute => {
                debug!(condition = %expr, "skipping attribute condition");
                continue;
            }
        };

        match dim_slot.get(&target) {
            Some(&slot) => builders[slot].push_condition(expr),
            None => {
                dim_slot.insert(target, builders.len());
                builders.push(BundleBuilder::dimension(target, expr));
            }
        }
    }

    let fact = occurrences[fact_idx].clone();
    let mut bundles = Vec::with_capacity(builders.len());
    for builder in builders {
        match builder.build(&occurrences, &inner_joined, fact_idx, &edges) {
            Some(bundle) => bundles.push(bundle),
            None => debug!("skipping condition on table unreachable from the fact table"),
        }
    }

    Ok(AnalyzedQuery { fact, bundles })
}

fn register(
    factor: &TableFactor,
    is_inner: bool,
    occurrences: &mut Vec<TableOccurrence>,
    inner_joined: &mut Vec<bool>,
) {
    let occ = match factor {
        TableFactor::Table { name, alias, .. } => {
            let name = name.to_string();
            let alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| name.clone());
            TableOccurrence { name, alias }
        }
        TableFactor::Derived { alias, .. } => {
            let alias = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or_else(|| "__derived".to_string());
            TableOccurrence {
                name: "__derived".to_string(),
                alias,
            }
        }
        _ => return,
    };
    occurrences.push(occ);
    inner_joined.push(is_inner);
}

pub(crate) fn parse_single_select(sql: &str) -> Result<Query> {
    let statements = Parser::parse_sql(&GenericDialect {}, sql).context(ParseSnafu)?;
    if statements.len() != 1 {
        return StatementCountSnafu {
            count: statements.len(),
        }
        .fail();
    }
    match statements.into_iter().next().expect("one statement") {
        Statement::Query(query) => Ok(*query),
        _ => NotASelectSnafu.fail(),
    }
}

pub(crate) fn single_select_body(query: &Query) -> Result<&Select> {
    if query.with.is_some() {
        return WithClauseSnafu.fail();
    }
    match &*query.body {
        SetExpr::Select(select) => Ok(select.as_ref()),
        SetExpr::SetOperation { .. } => SetOperationSnafu.fail(),
        _ => NotASelectSnafu.fail(),
    }
}

fn is_disjunction(expr: &Expr) -> bool {
    match expr {
        Expr::Nested(inner) => is_disjunction(inner),
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            ..
        } => true,
        _ => false,
    }
}

fn flatten_and(expr: &Expr, out: &mut Vec<Expr>) {
    match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            flatten_and(left, out);
            flatten_and(right, out);
        }
        Expr::Nested(inner) => flatten_and(inner, out),
        other => out.push(other.clone()),
    }
}

/// `a.x = b.y` with `a != b` both known tables is a join edge.
fn as_join_edge(expr: &Expr, alias_map: &HashMap<&str, usize>) -> Option<JoinEdge> {
    let (left, right) = match expr {
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => (left, right),
        Expr::Nested(inner) => return as_join_edge(inner, alias_map),
        _ => return None,
    };

    let (la, lc) = as_qualified_column(left)?;
    let (ra, rc) = as_qualified_column(right)?;
    let li = *alias_map.get(la)?;
    let ri = *alias_map.get(ra)?;
    if li == ri {
        return None;
    }
    Some(JoinEdge {
        left: li,
        left_col: lc.to_string(),
        right: ri,
        right_col: rc.to_string(),
    })
}

fn as_qualified_column(expr: &Expr) -> Option<(&str, &str)> {
    match expr {
        Expr::CompoundIdentifier(parts) if parts.len() == 2 => {
            Some((parts[0].value.as_str(), parts[1].value.as_str()))
        }
        Expr::Nested(inner) => as_qualified_column(inner),
        _ => None,
    }
}

/// Tables referenced by one condition, with subquery-local aliases shadowed.
#[derive(Debug, Default)]
struct Refs {
    aliases: BTreeSet<usize>,
    has_unqualified: bool,
}

enum Classification {
    FactLocal,
    Dimension(usize),
    Attribute,
}

impl Refs {
    fn classify(&self, fact_idx: usize, single_table: bool) -> Classification {
        let mut aliases = self.aliases.clone();
        if self.has_unqualified {
            // Unqualified columns are only attributable when the query has a
            // single table; otherwise the condition is ambiguous.
            if single_table {
                aliases.insert(fact_idx);
            } else {
                return Classification::Attribute;
            }
        }

        match (aliases.len(), aliases.iter().next()) {
            (0, _) => Classification::Attribute,
            (1, Some(&idx)) if idx == fact_idx => Classification::FactLocal,
            (1, Some(&idx)) => Classification::Dimension(idx),
            _ => Classification::Attribute,
        }
    }
}

fn collect_refs(expr: &Expr, alias_map: &HashMap<&str, usize>) -> Refs {
    let mut refs = Refs::default();
    let mut shadowed = Vec::new();
    walk_refs(expr, alias_map, &mut shadowed, &mut refs, 0);
    refs
}

fn walk_refs(
    expr: &Expr,
    alias_map: &HashMap<&str, usize>,
    shadowed: &mut Vec<HashSet<String>>,
    refs: &mut Refs,
    depth: usize,
) {
    match expr {
        Expr::Identifier(_) => {
            if depth == 0 {
                refs.has_unqualified = true;
            }
        }
        Expr::CompoundIdentifier(parts) => {
            if let Some(first) = parts.first() {
                let name = first.value.as_str();
                let is_shadowed = shadowed.iter().any(|scope| scope.contains(name));
                if !is_shadowed {
                    if let Some(&idx) = alias_map.get(name) {
                        refs.aliases.insert(idx);
                    }
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            walk_refs(left, alias_map, shadowed, refs, depth);
            walk_refs(right, alias_map, shadowed, refs, depth);
        }
        Expr::UnaryOp { expr, .. } => walk_refs(expr, alias_map, shadowed, refs, depth),
        Expr::Nested(inner) => walk_refs(inner, alias_map, shadowed, refs, depth),
        Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            walk_refs(inner, alias_map, shadowed, refs, depth)
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            walk_refs(expr, alias_map, shadowed, refs, depth);
            walk_refs(low, alias_map, shadowed, refs, depth);
            walk_refs(high, alias_map, shadowed, refs, depth);
        }
        Expr::InList { expr, list, .. } => {
            walk_refs(expr, alias_map, shadowed, refs, depth);
            for item in list {
                walk_refs(item, alias_map, shadowed, refs, depth);
            }
        }
        Expr::InSubquery { expr, subquery, .. } => {
            walk_refs(expr, alias_map, shadowed, refs, depth);
            walk_query_refs(subquery, alias_map, shadowed, refs, depth);
        }
        Expr::Exists { subquery, .. } => walk_query_refs(subquery, alias_map, shadowed, refs, depth),
        Expr::Subquery(subquery) => walk_query_refs(subquery, alias_map, shadowed, refs, depth),
        _ => {}
    }
}

/// Walk a subquery for correlation references to outer tables. The
/// subquery's own FROM aliases shadow outer aliases of the same name.
fn walk_query_refs(
    query: &Query,
    alias_map: &HashMap<&str, usize>,
    shadowed: &mut Vec<HashSet<String>>,
    refs: &mut Refs,
    depth: usize,
) {
    let select = match &*query.body {
        SetExpr::Select(select) => select,
        _ => return,
    };

    let mut local = HashSet::new();
    for twj in &select.from {
        collect_local_aliases(&twj.relation, &mut local);
        for join in &twj.joins {
            collect_local_aliases(&join.relation, &mut local);
        }
    }
    shadowed.push(local);

    if let Some(selection) = &select.selection {
        walk_refs(selection, alias_map, shadowed, refs, depth + 1);
    }

    shadowed.pop();
}

fn collect_local_aliases(factor: &TableFactor, out: &mut HashSet<String>) {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            match alias {
                Some(a) => out.insert(a.name.value.clone()),
                None => out.insert(name.to_string()),
            };
        }
        TableFactor::Derived { alias: Some(a), .. } => {
            out.insert(a.name.value.clone());
        }
        _ => {}
    }
}

/// Accumulates the conditions of one bundle before path resolution.
#[derive(Debug)]
struct BundleBuilder {
    target: Option<usize>,
    conditions: Vec<Expr>,
}

impl BundleBuilder {
    fn fact_local(expr: Expr) -> Self {
        Self {
            target: None,
            conditions: vec![expr],
        }
    }

    fn dimension(target: usize, expr: Expr) -> Self {
        Self {
            target: Some(target),
            conditions: vec![expr],
        }
    }

    fn push_condition(&mut self, expr: Expr) {
        self.conditions.push(expr);
    }

    fn build(
        self,
        occurrences: &[TableOccurrence],
        inner_joined: &[bool],
        fact_idx: usize,
        edges: &[JoinEdge],
    ) -> Option<ConjunctBundle> {
        match self.target {
            None => {
                let expr = &self.conditions[0];
                Some(ConjunctBundle {
                    kind: BundleKind::FactLocal,
                    predicate_sql: render_condition(expr),
                    source_tables: BTreeSet::from([occurrences[fact_idx].alias.clone()]),
                })
            }
            Some(target) => {
                let path = shortest_path(target, fact_idx, occurrences.len(), inner_joined, edges)?;
                Some(collapse_dimension(
                    &self.conditions,
                    target,
                    &path,
                    occurrences,
                ))
            }
        }
    }
}

/// Parenthesise OR-rooted conditions so they survive AND-joining.
fn render_condition(expr: &Expr) -> String {
    if matches!(
        expr,
        Expr::BinaryOp {
            op: BinaryOperator::Or,
            ..
        }
    ) {
        format!("({expr})")
    } else {
        expr.to_string()
    }
}

/// One step of a dimension-to-fact path: the edge columns on the outer
/// (closer to fact) and inner (closer to dimension) side.
#[derive(Debug, Clone)]
struct PathStep {
    outer: usize,
    outer_col: String,
    inner: usize,
    inner_col: String,
}

/// BFS from `from` to `fact` over inner-join edges; the visited set makes
/// cyclic join graphs terminate. Returns fact-first steps.
fn shortest_path(
    from: usize,
    fact: usize,
    tables: usize,
    inner_joined: &[bool],
    edges: &[JoinEdge],
) -> Option<Vec<PathStep>> {
    let mut prev: Vec<Option<PathStep>> = vec![None; tables];
    let mut visited = vec![false; tables];
    let mut queue = VecDeque::new();

    visited[fact] = true;
    queue.push_back(fact);

    while let Some(current) = queue.pop_front() {
        if current == from {
            break;
        }
        for edge in edges {
            let (next, step) = if edge.left == current {
                (
                    edge.right,
                    PathStep {
                        outer: edge.left,
                        outer_col: edge.left_col.clone(),
                        inner: edge.right,
                        inner_col: edge.right_col.clone(),
                    },
                )
            } else if edge.right == current {
                (
                    edge.left,
                    PathStep {
                        outer: edge.right,
                        outer_col: edge.right_col.clone(),
                        inner: edge.left,
                        inner_col: edge.left_col.clone(),
                    },
                )
            } else {
                continue;
            };

            if visited[next] || !inner_joined[next] {
                continue;
            }
            visited[next] = true;
            prev[next] = Some(step);
            queue.push_back(next);
        }
    }

    if !visited[from] {
        return None;
    }

    // Walk back from the dimension to the fact table, then reverse into
    // fact-first order.
    let mut steps = Vec::new();
    let mut current = from;
    while current != fact {
        let step = prev[current].clone().expect("visited node has a parent");
        current = step.outer;
        steps.push(step);
    }
    steps.reverse();
    Some(steps)
}

/// Peel the join path into nested membership subqueries:
/// `fact.k IN (SELECT d1.key FROM d1 WHERE d1.j IN (SELECT ... WHERE conds))`.
fn collapse_dimension(
    conditions: &[Expr],
    target: usize,
    path: &[PathStep],
    occurrences: &[TableOccurrence],
) -> ConjunctBundle {
    let rendered: Vec<_> = conditions.iter().map(render_condition).collect();
    let mut predicate = rendered.join(" AND ");

    // Innermost first: the dimension itself, then each intermediate hop.
    for step in path.iter().rev() {
        let inner_occ = &occurrences[step.inner];
        let subquery = format!(
            "SELECT {}.{} FROM {} WHERE {}",
            inner_occ.alias,
            step.inner_col,
            inner_occ.render_from(),
            predicate
        );
        let outer_occ = &occurrences[step.outer];
        predicate = format!("{}.{} IN ({})", outer_occ.alias, step.outer_col, subquery);
    }

    ConjunctBundle {
        kind: BundleKind::Dimension { hops: path.len() },
        predicate_sql: predicate,
        source_tables: BTreeSet::from([occurrences[target].alias.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use assert_matches::assert_matches;

    #[test]
    fn single_table_conditions_are_fact_local() {
        let analyzed = analyze(
            "SELECT trip_id FROM taxi_trips WHERE fare > 10 AND passengers = 2",
            "taxi_trips",
        )
        .unwrap();

        assert_eq!(analyzed.fact.name, "taxi_trips");
        assert_eq!(analyzed.bundles.len(), 2);
        assert!(analyzed
            .bundles
            .iter()
            .all(|b| b.kind == BundleKind::FactLocal));
        assert_eq!(analyzed.bundles[0].predicate_sql, "fare > 10");
        assert_eq!(analyzed.bundles[1].predicate_sql, "passengers = 2");
    }

    #[test]
    fn in_subquery_conjuncts_are_fact_local() {
        let analyzed = analyze(
            "SELECT lo_custkey FROM lineorder \
             WHERE lo_custkey IN (SELECT c_custkey FROM customer WHERE c_region = 'ASIA') \
             AND lo_suppkey IN (SELECT s_suppkey FROM supplier WHERE s_region = 'ASIA') \
             AND lo_orderdate IN (SELECT d_datekey FROM date_dim WHERE d_year BETWEEN 1992 AND 1997)",
            "lineorder",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 3);
        assert!(analyzed
            .bundles
            .iter()
            .all(|b| b.kind == BundleKind::FactLocal));
    }

    #[test]
    fn dimension_filter_is_collapsed_single_hop() {
        let analyzed = analyze(
            "SELECT lo.lo_custkey FROM lineorder lo, customer c \
             WHERE lo.lo_custkey = c.c_custkey AND c.c_region = 'ASIA'",
            "lineorder",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        let bundle = &analyzed.bundles[0];
        assert_eq!(bundle.kind, BundleKind::Dimension { hops: 1 });
        assert_eq!(
            bundle.predicate_sql,
            "lo.lo_custkey IN (SELECT c.c_custkey FROM customer AS c WHERE c.c_region = 'ASIA')"
        );
    }

    #[test]
    fn same_dimension_conditions_form_one_bundle() {
        let analyzed = analyze(
            "SELECT lo.lo_custkey FROM lineorder lo, customer c \
             WHERE lo.lo_custkey = c.c_custkey AND c.c_region = 'ASIA' AND c.c_mktsegment = 'AUTO'",
            "lineorder",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        assert_eq!(
            analyzed.bundles[0].predicate_sql,
            "lo.lo_custkey IN (SELECT c.c_custkey FROM customer AS c \
             WHERE c.c_region = 'ASIA' AND c.c_mktsegment = 'AUTO')"
        );
    }

    #[test]
    fn deep_dimension_chain_is_peeled() {
        let analyzed = analyze(
            "SELECT l.l_orderkey FROM lineitem l, orders o, customer c \
             WHERE l.l_orderkey = o.o_orderkey AND o.o_custkey = c.c_custkey \
             AND c.c_nation = 'FRANCE'",
            "lineitem",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        let bundle = &analyzed.bundles[0];
        assert_eq!(bundle.kind, BundleKind::Dimension { hops: 2 });
        assert_eq!(
            bundle.predicate_sql,
            "l.l_orderkey IN (SELECT o.o_orderkey FROM orders AS o WHERE \
             o.o_custkey IN (SELECT c.c_custkey FROM customer AS c WHERE \
             c.c_nation = 'FRANCE'))"
        );
    }

    #[test]
    fn explicit_inner_join_provides_edges() {
        let analyzed = analyze(
            "SELECT lo.lo_custkey FROM lineorder lo \
             JOIN customer c ON lo.lo_custkey = c.c_custkey \
             WHERE c.c_region = 'ASIA'",
            "lineorder",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        assert_eq!(analyzed.bundles[0].kind, BundleKind::Dimension { hops: 1 });
    }

    #[test]
    fn left_joined_tables_are_not_collapsed() {
        let analyzed = analyze(
            "SELECT lo.lo_custkey FROM lineorder lo \
             LEFT JOIN customer c ON lo.lo_custkey = c.c_custkey \
             WHERE c.c_region = 'ASIA' AND lo.lo_discount > 2",
            "lineorder",
        )
        .unwrap();

        // The customer filter is dropped; the fact-local condition stays.
        assert_eq!(analyzed.bundles.len(), 1);
        assert_eq!(analyzed.bundles[0].predicate_sql, "lo.lo_discount > 2");
    }

    #[test]
    fn cross_table_conditions_are_attribute_conditions() {
        let analyzed = analyze(
            "SELECT lo.lo_custkey FROM lineorder lo, customer c \
             WHERE lo.lo_custkey = c.c_custkey AND lo.lo_quantity > c.c_minqty \
             AND lo.lo_discount > 2",
            "lineorder",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        assert_eq!(analyzed.bundles[0].predicate_sql, "lo.lo_discount > 2");
    }

    #[test]
    fn cyclic_join_graph_terminates() {
        let analyzed = analyze(
            "SELECT f.k FROM fact f, a, b \
             WHERE f.k = a.fk AND a.x = b.x AND b.y = f.y AND a.attr = 1",
            "fact",
        )
        .unwrap();

        assert_eq!(analyzed.bundles.len(), 1);
        assert_eq!(analyzed.bundles[0].kind, BundleKind::Dimension { hops: 1 });
    }

    #[test]
    fn disjunctive_where_is_rejected() {
        assert_matches!(
            analyze("SELECT k FROM f WHERE a = 1 OR b = 2", "f"),
            Err(Error::NotConjunctive)
        );
    }

    #[test]
    fn nested_or_within_a_conjunct_is_fine() {
        let analyzed = analyze(
            "SELECT k FROM f WHERE (a = 1 OR b = 2) AND c = 3",
            "f",
        )
        .unwrap();
        assert_eq!(analyzed.bundles.len(), 2);
        assert_eq!(analyzed.bundles[0].predicate_sql, "(a = 1 OR b = 2)");
    }

    #[test]
    fn set_operations_are_rejected() {
        assert_matches!(
            analyze("SELECT k FROM a UNION SELECT k FROM b", "a"),
            Err(Error::SetOperation)
        );
    }

    #[test]
    fn non_select_is_rejected() {
        assert_matches!(
            analyze("INSERT INTO t VALUES (1)", "t"),
            Err(Error::NotASelect)
        );
        assert_matches!(analyze("SELECT 1; SELECT 2", "t"), Err(Error::StatementCount { .. }));
    }

    #[test]
    fn missing_fact_table_is_rejected() {
        assert_matches!(
            analyze("SELECT k FROM other WHERE a = 1", "lineorder"),
            Err(Error::FactTableMissing { .. })
        );
    }

    #[test]
    fn queries_without_where_have_no_bundles() {
        let analyzed = analyze("SELECT k FROM f", "f").unwrap();
        assert!(analyzed.bundles.is_empty());
    }
}
