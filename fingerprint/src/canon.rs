//! Lowering of a `sqlparser` AST into the canonical fragment representation.
//!
//! The canonical form is what gets hashed, so everything here has one goal:
//! two semantically identical fragments must serialise to the same string.
//! The transformation steps are:
//!
//! 1. replace the top-level projection with the `<PK>` sentinel,
//! 2. resolve table aliases and later re-emit them as `t0, t1, ...` in
//!    order of first appearance in the canonical serialisation,
//! 3. flatten `AND`/`OR` chains and sort their children,
//! 4. sort `IN (...)` list literals,
//! 5. rewrite `BETWEEN` into its comparison pair and `<>` into `!=`,
//! 6. lower-case keywords while preserving identifier case.
//!
//! Sorting has to be stable under alias renaming, so sort keys are computed
//! from a serialisation that prints base table names instead of aliases.

use sqlparser::ast::{
    BinaryOperator, Expr, Join, JoinConstraint, JoinOperator, Query, Select, SelectItem, SetExpr,
    TableFactor, TableWithJoins, UnaryOperator, Value as AstValue,
};
use std::collections::HashMap;
use std::fmt::Write;

/// Identity of one table occurrence across the whole statement.
type TableId = usize;

#[derive(Debug, Clone)]
pub(crate) enum CanonTable {
    Base {
        id: TableId,
        name: String,
    },
    Derived {
        id: TableId,
        query: Box<CanonQuery>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct CanonJoin {
    pub(crate) operator: &'static str,
    pub(crate) table: CanonTable,
    pub(crate) constraint: Option<CanonExpr>,
}

#[derive(Debug, Clone)]
pub(crate) struct CanonFromItem {
    pub(crate) table: CanonTable,
    pub(crate) joins: Vec<CanonJoin>,
}

#[derive(Debug, Clone)]
pub(crate) struct CanonQuery {
    /// `None` means the projection was stripped and the sentinel is emitted.
    pub(crate) projection: Option<Vec<CanonExpr>>,
    pub(crate) from: Vec<CanonFromItem>,
    pub(crate) selection: Option<CanonExpr>,
    pub(crate) group_by: Vec<CanonExpr>,
    pub(crate) having: Option<CanonExpr>,
    pub(crate) limit: Option<CanonExpr>,
}

#[derive(Debug, Clone)]
pub(crate) enum CanonExpr {
    Column {
        table: Option<TableId>,
        /// Raw identifier path when the qualifier did not resolve to a table.
        path: Vec<String>,
    },
    Literal(String),
    Binary {
        op: String,
        left: Box<CanonExpr>,
        right: Box<CanonExpr>,
    },
    Unary {
        op: String,
        expr: Box<CanonExpr>,
    },
    And(Vec<CanonExpr>),
    Or(Vec<CanonExpr>),
    InList {
        expr: Box<CanonExpr>,
        list: Vec<CanonExpr>,
        negated: bool,
    },
    InSubquery {
        expr: Box<CanonExpr>,
        query: Box<CanonQuery>,
        negated: bool,
    },
    Exists(Box<CanonQuery>),
    IsNull {
        expr: Box<CanonExpr>,
        negated: bool,
    },
    Subquery(Box<CanonQuery>),
    /// Expression forms the canonicaliser does not model; serialised as-is.
    Opaque(String),
}

/// Alias scope chain used while lowering; innermost scope wins.
struct Scope<'a> {
    parent: Option<&'a Scope<'a>>,
    aliases: HashMap<String, TableId>,
}

impl<'a> Scope<'a> {
    fn resolve(&self, alias: &str) -> Option<TableId> {
        self.aliases
            .get(alias)
            .copied()
            .or_else(|| self.parent.and_then(|p| p.resolve(alias)))
    }
}

/// Registry of every table occurrence, indexed by [`TableId`].
#[derive(Debug, Default)]
pub(crate) struct Tables {
    names: Vec<String>,
}

impl Tables {
    fn add(&mut self, name: String) -> TableId {
        self.names.push(name);
        self.names.len() - 1
    }

    fn name(&self, id: TableId) -> &str {
        &self.names[id]
    }
}

pub(crate) struct Lowered {
    pub(crate) query: CanonQuery,
    pub(crate) tables: Tables,
}

/// Lower `query`, stripping the outermost projection.
pub(crate) fn lower_statement(query: &Query) -> Result<Lowered, String> {
    let mut tables = Tables::default();
    let root = Scope {
        parent: None,
        aliases: HashMap::new(),
    };
    let canon = lower_query(query, &root, &mut tables, true)?;
    Ok(Lowered {
        query: canon,
        tables,
    })
}

fn lower_query(
    query: &Query,
    parent: &Scope<'_>,
    tables: &mut Tables,
    strip_projection: bool,
) -> Result<CanonQuery, String> {
    if query.with.is_some() {
        return Err("WITH clauses are not canonicalisable".to_string());
    }

    let select = match &*query.body {
        SetExpr::Select(select) => select,
        _ => return Err("set operations are not canonicalisable".to_string()),
    };

    lower_select(select, query.limit.as_ref(), parent, tables, strip_projection)
}

fn lower_select(
    select: &Select,
    limit: Option<&Expr>,
    parent: &Scope<'_>,
    tables: &mut Tables,
    strip_projection: bool,
) -> Result<CanonQuery, String> {
    let mut scope = Scope {
        parent: Some(parent),
        aliases: HashMap::new(),
    };

    // Register every FROM relation before touching any expression so that
    // qualified references resolve regardless of clause order.
    let mut from = Vec::with_capacity(select.from.len());
    for twj in &select.from {
        from.push(lower_from_item_tables(twj, &mut scope, tables)?);
    }

    // Second pass: join constraints and derived subqueries see the full
    // scope of this SELECT.
    let mut lowered_from = Vec::with_capacity(from.len());
    for (twj, pre) in select.from.iter().zip(from) {
        lowered_from.push(lower_from_item_exprs(twj, pre, &scope, tables)?);
    }

    let selection = select
        .selection
        .as_ref()
        .map(|e| lower_expr(e, &scope, tables))
        .transpose()?;

    let projection = if strip_projection {
        None
    } else {
        let mut items = Vec::with_capacity(select.projection.len());
        for item in &select.projection {
            items.push(match item {
                SelectItem::UnnamedExpr(e) => lower_expr(e, &scope, tables)?,
                SelectItem::ExprWithAlias { expr, .. } => lower_expr(expr, &scope, tables)?,
                SelectItem::Wildcard => CanonExpr::Opaque("*".to_string()),
                SelectItem::QualifiedWildcard(name) => CanonExpr::Opaque(format!("{name}.*")),
            });
        }
        Some(items)
    };

    let group_by = select
        .group_by
        .iter()
        .map(|e| lower_expr(e, &scope, tables))
        .collect::<Result<Vec<_>, _>>()?;

    let having = select
        .having
        .as_ref()
        .map(|e| lower_expr(e, &scope, tables))
        .transpose()?;

    let limit = limit.map(|e| lower_expr(e, &scope, tables)).transpose()?;

    Ok(CanonQuery {
        projection,
        from: lowered_from,
        selection,
        group_by,
        having,
        limit,
    })
}

/// First pass over one FROM item: allocate table ids and scope aliases.
struct PreFromItem {
    relation: PreTable,
    joins: Vec<PreTable>,
}

enum PreTable {
    Base { id: TableId },
    Derived { id: TableId },
}

fn register_factor(
    factor: &TableFactor,
    scope: &mut Scope<'_>,
    tables: &mut Tables,
) -> Result<PreTable, String> {
    match factor {
        TableFactor::Table { name, alias, .. } => {
            let base = name.to_string();
            let id = tables.add(base.clone());
            let key = alias
                .as_ref()
                .map(|a| a.name.value.clone())
                .unwrap_or(base);
            scope.aliases.insert(key, id);
            Ok(PreTable::Base { id })
        }
        TableFactor::Derived { alias, .. } => {
            let id = tables.add("__derived".to_string());
            if let Some(alias) = alias {
                scope.aliases.insert(alias.name.value.clone(), id);
            }
            Ok(PreTable::Derived { id })
        }
        other => Err(format!("unsupported FROM relation: {other}")),
    }
}

fn lower_from_item_tables(
    twj: &TableWithJoins,
    scope: &mut Scope<'_>,
    tables: &mut Tables,
) -> Result<PreFromItem, String> {
    let relation = register_factor(&twj.relation, scope, tables)?;
    let mut joins = Vec::with_capacity(twj.joins.len());
    for join in &twj.joins {
        joins.push(register_factor(&join.relation, scope, tables)?);
    }
    Ok(PreFromItem { relation, joins })
}

fn lower_from_item_exprs(
    twj: &TableWithJoins,
    pre: PreFromItem,
    scope: &Scope<'_>,
    tables: &mut Tables,
) -> Result<CanonFromItem, String> {
    let table = lower_factor(&twj.relation, pre.relation, scope, tables)?;

    let mut joins = Vec::with_capacity(twj.joins.len());
    for (join, pre_table) in twj.joins.iter().zip(pre.joins) {
        let (operator, constraint) = lower_join_operator(join, scope, tables)?;
        joins.push(CanonJoin {
            operator,
            table: lower_factor(&join.relation, pre_table, scope, tables)?,
            constraint,
        });
    }

    Ok(CanonFromItem { table, joins })
}

fn lower_factor(
    factor: &TableFactor,
    pre: PreTable,
    scope: &Scope<'_>,
    tables: &mut Tables,
) -> Result<CanonTable, String> {
    match (factor, pre) {
        (TableFactor::Table { name, .. }, PreTable::Base { id }) => Ok(CanonTable::Base {
            id,
            name: name.to_string(),
        }),
        (TableFactor::Derived { subquery, .. }, PreTable::Derived { id }) => {
            let query = lower_query(subquery, scope, tables, false)?;
            Ok(CanonTable::Derived {
                id,
                query: Box::new(query),
            })
        }
        _ => Err("FROM relation changed between passes".to_string()),
    }
}

fn lower_join_operator(
    join: &Join,
    scope: &Scope<'_>,
    tables: &mut Tables,
) -> Result<(&'static str, Option<CanonExpr>), String> {
    let (name, constraint) = match &join.join_operator {
        JoinOperator::Inner(c) => ("join", Some(c)),
        JoinOperator::LeftOuter(c) => ("left join", Some(c)),
        JoinOperator::RightOuter(c) => ("right join", Some(c)),
        JoinOperator::FullOuter(c) => ("full join", Some(c)),
        JoinOperator::CrossJoin => ("cross join", None),
        other => return Err(format!("unsupported join operator: {other:?}")),
    };

    let constraint = match constraint {
        Some(JoinConstraint::On(expr)) => Some(lower_expr(expr, scope, tables)?),
        Some(JoinConstraint::Using(cols)) => Some(CanonExpr::Opaque(format!(
            "using ({})",
            cols.iter()
                .map(|c| c.value.clone())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        Some(JoinConstraint::Natural) => Some(CanonExpr::Opaque("natural".to_string())),
        Some(JoinConstraint::None) | None => None,
    };

    Ok((name, constraint))
}

fn lower_expr(
    expr: &Expr,
    scope: &Scope<'_>,
    tables: &mut Tables,
) -> Result<CanonExpr, String> {
    Ok(match expr {
        Expr::Identifier(ident) => CanonExpr::Column {
            table: None,
            path: vec![ident.value.clone()],
        },
        Expr::CompoundIdentifier(parts) => {
            let path: Vec<_> = parts.iter().map(|p| p.value.clone()).collect();
            match scope.resolve(&path[0]) {
                Some(id) if path.len() > 1 => CanonExpr::Column {
                    table: Some(id),
                    path: path[1..].to_vec(),
                },
                _ => CanonExpr::Column { table: None, path },
            }
        }
        Expr::Value(value) => CanonExpr::Literal(lower_value(value)),
        Expr::BinaryOp { left, op, right } => {
            // AND/OR chains become n-ary nodes so their children can be
            // sorted as one multiset.
            match op {
                BinaryOperator::And => {
                    let mut children = Vec::new();
                    collect_bool_chain(expr, true, scope, tables, &mut children)?;
                    CanonExpr::And(children)
                }
                BinaryOperator::Or => {
                    let mut children = Vec::new();
                    collect_bool_chain(expr, false, scope, tables, &mut children)?;
                    CanonExpr::Or(children)
                }
                _ => CanonExpr::Binary {
                    op: binary_op_str(op),
                    left: Box::new(lower_expr(left, scope, tables)?),
                    right: Box::new(lower_expr(right, scope, tables)?),
                },
            }
        }
        Expr::UnaryOp { op, expr } => CanonExpr::Unary {
            op: unary_op_str(op),
            expr: Box::new(lower_expr(expr, scope, tables)?),
        },
        Expr::Nested(inner) => lower_expr(inner, scope, tables)?,
        Expr::InList {
            expr,
            list,
            negated,
        } => CanonExpr::InList {
            expr: Box::new(lower_expr(expr, scope, tables)?),
            list: list
                .iter()
                .map(|e| lower_expr(e, scope, tables))
                .collect::<Result<Vec<_>, _>>()?,
            negated: *negated,
        },
        Expr::InSubquery {
            expr,
            subquery,
            negated,
        } => CanonExpr::InSubquery {
            expr: Box::new(lower_expr(expr, scope, tables)?),
            query: Box::new(lower_query(subquery, scope, tables, false)?),
            negated: *negated,
        },
        Expr::Exists { subquery, .. } => {
            CanonExpr::Exists(Box::new(lower_query(subquery, scope, tables, false)?))
        }
        Expr::Subquery(subquery) => {
            CanonExpr::Subquery(Box::new(lower_query(subquery, scope, tables, false)?))
        }
        Expr::Between {
            expr,
            negated,
            low,
            high,
        } => {
            // BETWEEN a AND b  ==>  (x >= a and x <= b)
            let x = lower_expr(expr, scope, tables)?;
            let low = lower_expr(low, scope, tables)?;
            let high = lower_expr(high, scope, tables)?;
            if *negated {
                CanonExpr::Or(vec![
                    CanonExpr::Binary {
                        op: "<".to_string(),
                        left: Box::new(x.clone()),
                        right: Box::new(low),
                    },
                    CanonExpr::Binary {
                        op: ">".to_string(),
                        left: Box::new(x),
                        right: Box::new(high),
                    },
                ])
            } else {
                CanonExpr::And(vec![
                    CanonExpr::Binary {
                        op: ">=".to_string(),
                        left: Box::new(x.clone()),
                        right: Box::new(low),
                    },
                    CanonExpr::Binary {
                        op: "<=".to_string(),
                        left: Box::new(x),
                        right: Box::new(high),
                    },
                ])
            }
        }
        Expr::IsNull(inner) => CanonExpr::IsNull {
            expr: Box::new(lower_expr(inner, scope, tables)?),
            negated: false,
        },
        Expr::IsNotNull(inner) => CanonExpr::IsNull {
            expr: Box::new(lower_expr(inner, scope, tables)?),
            negated: true,
        },
        other => CanonExpr::Opaque(other.to_string()),
    })
}

fn collect_bool_chain(
    expr: &Expr,
    conjunction: bool,
    scope: &Scope<'_>,
    tables: &mut Tables,
    out: &mut Vec<CanonExpr>,
) -> Result<(), String> {
    match expr {
        Expr::BinaryOp { left, op, right }
            if (conjunction && *op == BinaryOperator::And)
                || (!conjunction && *op == BinaryOperator::Or) =>
        {
            collect_bool_chain(left, conjunction, scope, tables, out)?;
            collect_bool_chain(right, conjunction, scope, tables, out)?;
        }
        Expr::Nested(inner) => collect_bool_chain(inner, conjunction, scope, tables, out)?,
        other => out.push(lower_expr(other, scope, tables)?),
    }
    Ok(())
}

fn binary_op_str(op: &BinaryOperator) -> String {
    match op {
        BinaryOperator::Eq => "=".to_string(),
        BinaryOperator::NotEq => "!=".to_string(),
        BinaryOperator::Lt => "<".to_string(),
        BinaryOperator::LtEq => "<=".to_string(),
        BinaryOperator::Gt => ">".to_string(),
        BinaryOperator::GtEq => ">=".to_string(),
        BinaryOperator::Plus => "+".to_string(),
        BinaryOperator::Minus => "-".to_string(),
        BinaryOperator::Multiply => "*".to_string(),
        BinaryOperator::Divide => "/".to_string(),
        BinaryOperator::Modulo => "%".to_string(),
        other => other.to_string().to_lowercase(),
    }
}

fn unary_op_str(op: &UnaryOperator) -> String {
    match op {
        UnaryOperator::Not => "not".to_string(),
        UnaryOperator::Minus => "-".to_string(),
        UnaryOperator::Plus => "+".to_string(),
        other => other.to_string().to_lowercase(),
    }
}

fn lower_value(value: &AstValue) -> String {
    match value {
        AstValue::Number(n, _) => n.clone(),
        AstValue::SingleQuotedString(s) => format!("'{}'", s.replace('\'', "''")),
        AstValue::DoubleQuotedString(s) => format!("'{}'", s.replace('\'', "''")),
        AstValue::Boolean(b) => b.to_string(),
        AstValue::Null => "null".to_string(),
        other => other.to_string().to_lowercase(),
    }
}

// ---------------------------------------------------------------------------
// Normalisation: sort AND/OR multisets and IN lists.
// ---------------------------------------------------------------------------

/// Rank used as the leading sort component, keyed on the operator kind.
fn rank(expr: &CanonExpr) -> u8 {
    match expr {
        CanonExpr::Binary { .. } => 10,
        CanonExpr::InList { .. } => 20,
        CanonExpr::InSubquery { .. } => 30,
        CanonExpr::Exists(_) => 40,
        CanonExpr::IsNull { .. } => 50,
        CanonExpr::And(_) => 60,
        CanonExpr::Or(_) => 70,
        CanonExpr::Unary { .. } => 80,
        CanonExpr::Column { .. } => 90,
        CanonExpr::Literal(_) => 91,
        CanonExpr::Subquery(_) => 92,
        CanonExpr::Opaque(_) => 99,
    }
}

pub(crate) fn normalize_query(query: &mut CanonQuery, tables: &Tables) {
    if let Some(projection) = &mut query.projection {
        for e in projection.iter_mut() {
            normalize_expr(e, tables);
        }
    }
    for item in &mut query.from {
        normalize_table(&mut item.table, tables);
        for join in &mut item.joins {
            normalize_table(&mut join.table, tables);
            if let Some(c) = &mut join.constraint {
                normalize_expr(c, tables);
            }
        }
    }
    if let Some(s) = &mut query.selection {
        normalize_expr(s, tables);
    }
    for e in &mut query.group_by {
        normalize_expr(e, tables);
    }
    if let Some(h) = &mut query.having {
        normalize_expr(h, tables);
    }
    if let Some(l) = &mut query.limit {
        normalize_expr(l, tables);
    }
}

fn normalize_table(table: &mut CanonTable, tables: &Tables) {
    if let CanonTable::Derived { query, .. } = table {
        normalize_query(query, tables);
    }
}

fn normalize_expr(expr: &mut CanonExpr, tables: &Tables) {
    match expr {
        CanonExpr::Binary { left, right, .. } => {
            normalize_expr(left, tables);
            normalize_expr(right, tables);
        }
        CanonExpr::Unary { expr, .. } => normalize_expr(expr, tables),
        CanonExpr::And(children) => {
            for c in children.iter_mut() {
                normalize_expr(c, tables);
            }
            flatten_chain(children, |c| match c {
                CanonExpr::And(inner) => Ok(inner),
                other => Err(other),
            });
            children.sort_by_cached_key(|c| (rank(c), sort_key(c, tables)));
        }
        CanonExpr::Or(children) => {
            for c in children.iter_mut() {
                normalize_expr(c, tables);
            }
            flatten_chain(children, |c| match c {
                CanonExpr::Or(inner) => Ok(inner),
                other => Err(other),
            });
            children.sort_by_cached_key(|c| (rank(c), sort_key(c, tables)));
        }
        CanonExpr::InList { expr, list, .. } => {
            normalize_expr(expr, tables);
            for e in list.iter_mut() {
                normalize_expr(e, tables);
            }
            list.sort_by_cached_key(|e| sort_key(e, tables));
        }
        CanonExpr::InSubquery { expr, query, .. } => {
            normalize_expr(expr, tables);
            normalize_query(query, tables);
        }
        CanonExpr::Exists(query) | CanonExpr::Subquery(query) => normalize_query(query, tables),
        CanonExpr::IsNull { expr, .. } => normalize_expr(expr, tables),
        CanonExpr::Column { .. } | CanonExpr::Literal(_) | CanonExpr::Opaque(_) => {}
    }
}

/// Splice children of the same chain kind into their parent, so that
/// `a and (b and c)` and `a and b and c` normalise identically.
fn flatten_chain(
    children: &mut Vec<CanonExpr>,
    unwrap: impl Fn(CanonExpr) -> Result<Vec<CanonExpr>, CanonExpr>,
) {
    let mut flattened = Vec::with_capacity(children.len());
    for child in children.drain(..) {
        match unwrap(child) {
            Ok(inner) => flattened.extend(inner),
            Err(child) => flattened.push(child),
        }
    }
    *children = flattened;
}

/// Rename-invariant serialisation used only for ordering decisions: table
/// references print their base table name, never the alias.
fn sort_key(expr: &CanonExpr, tables: &Tables) -> String {
    let mut serializer = Serializer::sort_key(tables);
    let mut out = String::new();
    serializer.expr(expr, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Serialisation.
// ---------------------------------------------------------------------------

enum AliasMode {
    /// Print the base table name (stable under alias renaming).
    BaseName,
    /// Assign `t0, t1, ...` on first appearance.
    Canonical {
        assigned: HashMap<TableId, usize>,
        next: usize,
    },
}

pub(crate) struct Serializer<'a> {
    tables: &'a Tables,
    mode: AliasMode,
}

impl<'a> Serializer<'a> {
    pub(crate) fn canonical(tables: &'a Tables) -> Self {
        Self {
            tables,
            mode: AliasMode::Canonical {
                assigned: HashMap::new(),
                next: 0,
            },
        }
    }

    fn sort_key(tables: &'a Tables) -> Self {
        Self {
            tables,
            mode: AliasMode::BaseName,
        }
    }

    fn alias(&mut self, id: TableId) -> String {
        match &mut self.mode {
            AliasMode::BaseName => self.tables.name(id).to_string(),
            AliasMode::Canonical { assigned, next } => {
                let n = *assigned.entry(id).or_insert_with(|| {
                    let n = *next;
                    *next += 1;
                    n
                });
                format!("t{n}")
            }
        }
    }

    pub(crate) fn query(&mut self, query: &CanonQuery, out: &mut String) {
        out.push_str("select ");
        match &query.projection {
            None => out.push_str("<PK>"),
            Some(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.expr(item, out);
                }
            }
        }

        if !query.from.is_empty() {
            out.push_str(" from ");
            for (i, item) in query.from.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                self.from_item(item, out);
            }
        }

        if let Some(selection) = &query.selection {
            out.push_str(" where ");
            self.expr(selection, out);
        }

        if !query.group_by.is_empty() {
            out.push_str(" group by ");
            for (i, e) in query.group_by.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                self.expr(e, out);
            }
        }

        if let Some(having) = &query.having {
            out.push_str(" having ");
            self.expr(having, out);
        }

        if let Some(limit) = &query.limit {
            out.push_str(" limit ");
            self.expr(limit, out);
        }
    }

    fn from_item(&mut self, item: &CanonFromItem, out: &mut String) {
        self.table(&item.table, out);
        for join in &item.joins {
            write!(out, " {} ", join.operator).expect("write to string");
            self.table(&join.table, out);
            if let Some(constraint) = &join.constraint {
                out.push_str(" on ");
                self.expr(constraint, out);
            }
        }
    }

    fn table(&mut self, table: &CanonTable, out: &mut String) {
        match table {
            CanonTable::Base { id, name } => {
                let alias = self.alias(*id);
                if alias == *name {
                    out.push_str(name);
                } else {
                    write!(out, "{name} as {alias}").expect("write to string");
                }
            }
            CanonTable::Derived { id, query } => {
                out.push('(');
                self.query(query, out);
                out.push(')');
                let alias = self.alias(*id);
                write!(out, " as {alias}").expect("write to string");
            }
        }
    }

    pub(crate) fn expr(&mut self, expr: &CanonExpr, out: &mut String) {
        match expr {
            CanonExpr::Column { table, path } => {
                if let Some(id) = table {
                    let alias = self.alias(*id);
                    write!(out, "{alias}.").expect("write to string");
                }
                out.push_str(&path.join("."));
            }
            CanonExpr::Literal(lit) => out.push_str(lit),
            CanonExpr::Binary { op, left, right } => {
                self.operand(left, out);
                write!(out, " {op} ").expect("write to string");
                self.operand(right, out);
            }
            CanonExpr::Unary { op, expr } => {
                write!(out, "{op} ").expect("write to string");
                self.operand(expr, out);
            }
            CanonExpr::And(children) => self.bool_chain("and", children, out),
            CanonExpr::Or(children) => self.bool_chain("or", children, out),
            CanonExpr::InList {
                expr,
                list,
                negated,
            } => {
                self.expr(expr, out);
                out.push_str(if *negated { " not in (" } else { " in (" });
                for (i, e) in list.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.expr(e, out);
                }
                out.push(')');
            }
            CanonExpr::InSubquery {
                expr,
                query,
                negated,
            } => {
                self.expr(expr, out);
                out.push_str(if *negated { " not in (" } else { " in (" });
                self.query(query, out);
                out.push(')');
            }
            CanonExpr::Exists(query) => {
                out.push_str("exists (");
                self.query(query, out);
                out.push(')');
            }
            CanonExpr::IsNull { expr, negated } => {
                self.expr(expr, out);
                out.push_str(if *negated { " is not null" } else { " is null" });
            }
            CanonExpr::Subquery(query) => {
                out.push('(');
                self.query(query, out);
                out.push(')');
            }
            CanonExpr::Opaque(raw) => out.push_str(raw),
        }
    }

    fn bool_chain(&mut self, op: &str, children: &[CanonExpr], out: &mut String) {
        out.push('(');
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                write!(out, " {op} ").expect("write to string");
            }
            self.expr(child, out);
        }
        out.push(')');
    }

    /// Serialise a nested operand, parenthesising composite expressions so
    /// that distinct groupings serialise distinctly.
    fn operand(&mut self, expr: &CanonExpr, out: &mut String) {
        match expr {
            CanonExpr::Binary { .. } | CanonExpr::Unary { .. } => {
                out.push('(');
                self.expr(expr, out);
                out.push(')');
            }
            _ => self.expr(expr, out),
        }
    }
}
