use crate::record::IndexValue;

/// Comparison operator for a `Filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl FilterOp {
    fn as_sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Gt => ">",
            FilterOp::Le => "<=",
            FilterOp::Ge => ">=",
        }
    }
}

/// A single field comparison against an indexed field. `Store::query` ANDs
/// together a `Vec<Filter>`.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: IndexValue) -> Self {
        Self {
            field: field.into(),
            op,
            value,
        }
    }

    pub fn eq(field: impl Into<String>, value: IndexValue) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    /// Render as a `(sql_fragment, bound_value)` pair against the store's
    /// `fields` side table. `idx` disambiguates bound-parameter names when
    /// several filters touch the same underlying column name.
    pub(crate) fn to_sql(&self, idx: usize) -> (String, String) {
        let param = format!(":f{idx}");
        (
            format!(
                "EXISTS (SELECT 1 FROM fields WHERE fields.record_id = records.id AND fields.key = :k{idx} AND fields.value {} {param})",
                self.op.as_sql()
            ),
            self.value.as_sql(),
        )
    }
}
