use serde::{Deserialize, Serialize};
use sqlx::{Postgres, QueryBuilder};
use utoipa::IntoParams;

// --- Query-String Parsing ---

/// Page size used when the client sends no (or an invalid) `limit`.
pub const DEFAULT_LIMIT: u64 = 10;
/// Upper bound applied by the parser to any client-supplied `limit`.
pub const MAX_LIMIT: u64 = 100;

/// ListParams
///
/// The raw, untrusted query string of a list endpoint
/// (`GET /users?page=2&limit=10&order_by=name&order=desc&filter_by=role&filter=1&search_by=email&search=gmail`).
/// Every field is kept as a string so that garbage input degrades to defaults
/// instead of rejecting the request.
#[derive(Debug, Clone, Default, Deserialize, Serialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListParams {
    pub page: Option<String>,
    pub limit: Option<String>,
    pub search_by: Option<String>,
    pub search: Option<String>,
    pub filter_by: Option<String>,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    pub order: Option<String>,
}

/// Bounds the parser applies to `page`/`limit`. Injected from `AppConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageDefaults {
    pub default_limit: u64,
    pub max_limit: u64,
}

impl Default for PageDefaults {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    /// Anything other than exactly `desc` sorts ascending.
    pub fn parse(raw: &str) -> Self {
        if raw == "desc" {
            SortDirection::Desc
        } else {
            SortDirection::Asc
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

/// QuerySpec
///
/// The validated, bounded form of a list request. `page` and `limit` are
/// always at least 1; field names are still the public keys chosen by the
/// client and are only resolved to columns against an [`AllowList`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySpec {
    pub page: u64,
    pub limit: u64,
    pub sort_field: Option<String>,
    pub sort_direction: SortDirection,
    pub filter_field: Option<String>,
    pub filter_value: Option<String>,
    pub search_field: Option<String>,
    pub search_value: Option<String>,
}

impl Default for QuerySpec {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_LIMIT,
            sort_field: None,
            sort_direction: SortDirection::Asc,
            filter_field: None,
            filter_value: None,
            search_field: None,
            search_value: None,
        }
    }
}

impl QuerySpec {
    /// parse
    ///
    /// Turns raw query parameters into a spec. Never fails:
    /// - `page` that is missing, unparsable or `<= 0` becomes 1.
    /// - `limit` that is missing, unparsable or `<= 0` becomes the default;
    ///   anything above `max_limit` is capped.
    /// - blank strings are treated as absent.
    pub fn parse(params: &ListParams, defaults: PageDefaults) -> Self {
        let page = parse_positive(params.page.as_deref()).unwrap_or(1);

        let limit = parse_positive(params.limit.as_deref())
            .unwrap_or(defaults.default_limit)
            .min(defaults.max_limit.max(1))
            .max(1);

        Self {
            page,
            limit,
            sort_field: non_blank(&params.order_by),
            sort_direction: params
                .order
                .as_deref()
                .map(SortDirection::parse)
                .unwrap_or_default(),
            filter_field: non_blank(&params.filter_by),
            filter_value: non_blank(&params.filter),
            search_field: non_blank(&params.search_by),
            search_value: non_blank(&params.search),
        }
    }

    /// Row offset of the first item of `page`, saturated at [`MAX_OFFSET`].
    pub fn offset(&self) -> u64 {
        (self.page.max(1) - 1)
            .saturating_mul(self.limit.max(1))
            .min(MAX_OFFSET)
    }
}

/// Largest offset Postgres accepts (`OFFSET` is a BIGINT). Pages past it are
/// simply empty.
pub const MAX_OFFSET: u64 = i64::MAX as u64;

fn parse_positive(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
}

fn non_blank(raw: &Option<String>) -> Option<String> {
    raw.as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// --- Allow-Lists ---

/// AllowList
///
/// Maps the public field keys a client may sort/filter/search by to the
/// storage columns they stand for. Defined as constants next to each
/// repository query; never built from user input, which is what makes it
/// safe to splice the column names into SQL.
#[derive(Debug, Clone, Copy)]
pub struct AllowList {
    fields: &'static [(&'static str, &'static str)],
}

impl AllowList {
    pub const fn new(fields: &'static [(&'static str, &'static str)]) -> Self {
        Self { fields }
    }

    /// Resolves a public key to its column; unknown keys resolve to nothing.
    pub fn column(&self, key: &str) -> Option<&'static str> {
        self.fields
            .iter()
            .find(|(public, _)| *public == key)
            .map(|(_, column)| *column)
    }
}

// --- List-Query Composer ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub limit: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ordering {
    pub column: &'static str,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    pub column: &'static str,
    pub value: String,
}

/// ListQuery
///
/// An immutable description of the scopes to apply on top of a base
/// `SELECT ... WHERE <base condition>`. Each scope occupies one slot and
/// applying a scope replaces its slot, so composing the same spec twice
/// yields the same query (no doubled LIMIT/OFFSET or predicates).
///
/// Keys that are not in the allow-list leave their slot empty; this is
/// not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub window: Option<Window>,
    pub ordering: Option<Ordering>,
    pub filter: Option<Predicate>,
    pub search: Option<Predicate>,
}

impl ListQuery {
    /// Applies all four scopes of `spec`.
    pub fn compose(spec: &QuerySpec, allowed: &AllowList) -> Self {
        ListQuery::default()
            .paginate(spec)
            .order(spec, allowed)
            .filter(spec, allowed)
            .search(spec, allowed)
    }

    /// `LIMIT limit OFFSET (page-1)*limit`, with page and limit clamped to >= 1
    /// and the offset saturated at [`MAX_OFFSET`].
    /// No upper bound is enforced on the limit here; [`QuerySpec::parse`] caps it.
    pub fn paginate(mut self, spec: &QuerySpec) -> Self {
        self.window = Some(Window {
            limit: spec.limit.max(1).min(MAX_OFFSET),
            offset: spec.offset(),
        });
        self
    }

    pub fn order(mut self, spec: &QuerySpec, allowed: &AllowList) -> Self {
        self.ordering = spec
            .sort_field
            .as_deref()
            .and_then(|key| allowed.column(key))
            .map(|column| Ordering {
                column,
                direction: spec.sort_direction,
            });
        self
    }

    /// Equality on a single allow-listed column. An empty value disables it.
    pub fn filter(mut self, spec: &QuerySpec, allowed: &AllowList) -> Self {
        self.filter = resolve(
            spec.filter_field.as_deref(),
            spec.filter_value.as_deref(),
            allowed,
        );
        self
    }

    /// Case-insensitive substring match on a single allow-listed column.
    pub fn search(mut self, spec: &QuerySpec, allowed: &AllowList) -> Self {
        self.search = resolve(
            spec.search_field.as_deref(),
            spec.search_value.as_deref(),
            allowed,
        );
        self
    }

    /// The scopes that decide *which* rows match, without ordering or
    /// pagination. Used to compute the total for pagination metadata.
    pub fn count_scope(&self) -> Self {
        Self {
            window: None,
            ordering: None,
            filter: self.filter.clone(),
            search: self.search.clone(),
        }
    }

    /// Appends `AND` predicates. The base query must already contain a `WHERE`.
    pub fn push_predicates(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if let Some(filter) = &self.filter {
            builder.push(" AND CAST(");
            builder.push(filter.column);
            builder.push(" AS TEXT) = ");
            builder.push_bind(filter.value.clone());
        }

        if let Some(search) = &self.search {
            builder.push(" AND CAST(");
            builder.push(search.column);
            builder.push(" AS TEXT) ILIKE ");
            builder.push_bind(like_pattern(&search.value));
        }
    }

    pub fn push_ordering(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if let Some(ordering) = &self.ordering {
            builder.push(" ORDER BY ");
            builder.push(ordering.column);
            builder.push(" ");
            builder.push(ordering.direction.as_sql());
        }
    }

    pub fn push_window(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        if let Some(window) = &self.window {
            builder.push(" LIMIT ");
            builder.push_bind(window.limit as i64);
            builder.push(" OFFSET ");
            builder.push_bind(window.offset as i64);
        }
    }

    /// Predicates, then ordering, then the page window.
    pub fn push_all(&self, builder: &mut QueryBuilder<'_, Postgres>) {
        self.push_predicates(builder);
        self.push_ordering(builder);
        self.push_window(builder);
    }
}

fn resolve(field: Option<&str>, value: Option<&str>, allowed: &AllowList) -> Option<Predicate> {
    let column = allowed.column(field?)?;
    let value = value.filter(|v| !v.is_empty())?;
    Some(Predicate {
        column,
        value: value.to_string(),
    })
}

/// Wraps `value` in `%...%`, escaping LIKE metacharacters so they match literally.
pub fn like_pattern(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('%');
    for ch in value.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped.push('%');
    escaped
}

/// Page<T>
///
/// One page of rows in applied order plus the number of rows matching the
/// filter/search scopes regardless of pagination.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_count: u64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total_count: u64) -> Self {
        Self { items, total_count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const USERS: AllowList = AllowList::new(&[
        ("name", "users.name"),
        ("email", "users.email"),
        ("created", "users.created_at"),
    ]);

    fn params(pairs: &[(&str, &str)]) -> ListParams {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        let get = |k: &str| map.get(k).map(|v| v.to_string());
        ListParams {
            page: get("page"),
            limit: get("limit"),
            search_by: get("search_by"),
            search: get("search"),
            filter_by: get("filter_by"),
            filter: get("filter"),
            order_by: get("order_by"),
            order: get("order"),
        }
    }

    fn spec(pairs: &[(&str, &str)]) -> QuerySpec {
        QuerySpec::parse(&params(pairs), PageDefaults::default())
    }

    fn rendered(query: &ListQuery) -> String {
        let mut builder = QueryBuilder::<Postgres>::new("SELECT * FROM users WHERE deleted_at IS NULL");
        query.push_all(&mut builder);
        builder.sql().to_string()
    }

    // Minimal evaluator standing in for the database: rows are column -> value maps.
    fn run(rows: &[HashMap<&'static str, String>], query: &ListQuery) -> Vec<String> {
        let mut matched: Vec<&HashMap<&'static str, String>> = rows
            .iter()
            .filter(|row| {
                query
                    .filter
                    .as_ref()
                    .is_none_or(|f| row.get(f.column) == Some(&f.value))
            })
            .filter(|row| {
                query.search.as_ref().is_none_or(|s| {
                    row.get(s.column)
                        .is_some_and(|v| v.to_lowercase().contains(&s.value.to_lowercase()))
                })
            })
            .collect();

        if let Some(ordering) = &query.ordering {
            matched.sort_by(|a, b| a[ordering.column].cmp(&b[ordering.column]));
            if ordering.direction == SortDirection::Desc {
                matched.reverse();
            }
        }

        let (offset, limit) = query
            .window
            .map(|w| (w.offset as usize, w.limit as usize))
            .unwrap_or((0, usize::MAX));

        matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|row| row["users.name"].clone())
            .collect()
    }

    fn seed(n: usize) -> Vec<HashMap<&'static str, String>> {
        (1..=n)
            .map(|i| {
                HashMap::from([
                    ("users.name", format!("user-{:02}", i)),
                    ("users.email", format!("user{}@example.com", i)),
                    ("users.status", "active".to_string()),
                ])
            })
            .collect()
    }

    #[test]
    fn invalid_page_falls_back_to_first_page() {
        for raw in ["0", "-3", "abc", "", "  "] {
            assert_eq!(spec(&[("page", raw)]).page, 1, "page={raw:?}");
        }
        assert_eq!(QuerySpec::parse(&ListParams::default(), PageDefaults::default()).page, 1);
    }

    #[test]
    fn invalid_limit_falls_back_to_default() {
        for raw in ["0", "-10", "ten"] {
            assert_eq!(spec(&[("limit", raw)]).limit, DEFAULT_LIMIT, "limit={raw:?}");
        }
    }

    #[test]
    fn limit_is_capped_by_parser() {
        assert_eq!(spec(&[("limit", "5000")]).limit, MAX_LIMIT);
    }

    #[test]
    fn direction_is_asc_unless_exactly_desc() {
        assert_eq!(spec(&[("order", "desc")]).sort_direction, SortDirection::Desc);
        assert_eq!(spec(&[("order", "DESC")]).sort_direction, SortDirection::Asc);
        assert_eq!(spec(&[("order", "sideways")]).sort_direction, SortDirection::Asc);
    }

    #[test]
    fn composer_clamps_page_and_limit() {
        let raw = QuerySpec {
            page: 0,
            limit: 0,
            ..QuerySpec::default()
        };
        let query = ListQuery::default().paginate(&raw);
        assert_eq!(query.window, Some(Window { limit: 1, offset: 0 }));
    }

    #[test]
    fn offset_follows_page() {
        let query = ListQuery::compose(&spec(&[("page", "3"), ("limit", "10")]), &USERS);
        assert_eq!(query.window, Some(Window { limit: 10, offset: 20 }));
    }

    #[test]
    fn unknown_keys_compose_like_empty_spec() {
        let invalid = spec(&[
            ("order_by", "password"),
            ("order", "desc"),
            ("filter_by", "status"),
            ("filter", "active"),
            ("search_by", "1; DROP TABLE users"),
            ("search", "x"),
        ]);
        let empty = spec(&[]);

        assert_eq!(
            ListQuery::compose(&invalid, &USERS),
            ListQuery::compose(&empty, &USERS)
        );
    }

    #[test]
    fn composing_twice_is_idempotent() {
        let s = spec(&[("page", "2"), ("order_by", "name"), ("filter_by", "email"), ("filter", "a@b.c")]);
        let once = ListQuery::compose(&s, &USERS);
        let twice = once
            .clone()
            .paginate(&s)
            .order(&s, &USERS)
            .filter(&s, &USERS)
            .search(&s, &USERS);

        assert_eq!(once, twice);
        assert_eq!(rendered(&once), rendered(&twice));
        assert_eq!(rendered(&twice).matches("LIMIT").count(), 1);
    }

    #[test]
    fn empty_filter_value_is_ignored() {
        let s = QuerySpec {
            filter_field: Some("email".into()),
            filter_value: Some(String::new()),
            ..QuerySpec::default()
        };
        assert!(ListQuery::compose(&s, &USERS).filter.is_none());
    }

    #[test]
    fn renders_allow_listed_columns_and_binds_values() {
        let s = spec(&[
            ("page", "2"),
            ("order_by", "name"),
            ("order", "desc"),
            ("filter_by", "email"),
            ("filter", "a@b.c"),
            ("search_by", "name"),
            ("search", "ann"),
        ]);
        let sql = rendered(&ListQuery::compose(&s, &USERS));

        assert_eq!(
            sql,
            "SELECT * FROM users WHERE deleted_at IS NULL \
             AND CAST(users.email AS TEXT) = $1 \
             AND CAST(users.name AS TEXT) ILIKE $2 \
             ORDER BY users.name DESC LIMIT $3 OFFSET $4"
        );
    }

    #[test]
    fn count_scope_drops_ordering_and_window() {
        let s = spec(&[("page", "4"), ("order_by", "name"), ("search_by", "email"), ("search", "gmail")]);
        let count = ListQuery::compose(&s, &USERS).count_scope();

        assert!(count.window.is_none());
        assert!(count.ordering.is_none());
        assert!(count.search.is_some());
        assert!(!rendered(&count).contains("LIMIT"));
    }

    #[test]
    fn like_metacharacters_are_escaped() {
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn second_page_of_twenty_five_sorted_desc() {
        let rows = seed(25);
        let s = spec(&[("page", "2"), ("limit", "10"), ("order_by", "name"), ("order", "desc")]);
        let query = ListQuery::compose(&s, &USERS);

        let names = run(&rows, &query);
        let expected: Vec<String> = (6..=15).rev().map(|i| format!("user-{:02}", i)).collect();

        assert_eq!(names, expected);
        assert_eq!(run(&rows, &query.count_scope()).len(), 25);
    }

    #[test]
    fn filter_outside_allow_list_returns_full_count() {
        let rows = seed(25);
        let s = spec(&[("filter_by", "status"), ("filter", "inactive")]);
        let query = ListQuery::compose(&s, &USERS);

        assert!(query.filter.is_none());
        assert_eq!(run(&rows, &query.count_scope()).len(), 25);
    }

    #[test]
    fn huge_page_saturates_offset() {
        let rows = seed(25);
        let s = spec(&[("page", &i64::MAX.to_string()), ("limit", "10")]);
        assert_eq!(s.page, i64::MAX as u64);

        let query = ListQuery::compose(&s, &USERS);
        let window = query.window.unwrap();

        assert_eq!(window.offset, MAX_OFFSET);
        assert_eq!(window.limit, 10);
        assert!(i64::try_from(window.offset).is_ok());
        assert!(run(&rows, &query).is_empty());
        assert_eq!(run(&rows, &query.count_scope()).len(), 25);
    }
}
