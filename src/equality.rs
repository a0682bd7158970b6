use crate::cache::entry::QueryStatus;

/// Comparator consumed as configuration.
///
/// Duplicate suppression happens at two sensitivities: projected data inside
/// `select`, and whole statuses inside `status`. The provided `status_eq`
/// composes `data_eq` with field-wise comparison; implement it only when the
/// data comparison alone is not what subscribers should key on.
pub trait Equality<A>: Send + Sync + 'static {
    fn data_eq(&self, a: &A, b: &A) -> bool;

    fn status_eq(&self, a: &QueryStatus<A>, b: &QueryStatus<A>) -> bool {
        let error_eq = match (&a.error, &b.error) {
            (None, None) => true,
            (Some(x), Some(y)) => x.same(y),
            _ => false,
        };
        a.ts == b.ts
            && a.loading == b.loading
            && a.untrusted_data == b.untrusted_data
            && error_eq
            && self.data_eq(&a.data, &b.data)
    }
}

/// `PartialEq`-backed comparator, the default for every store.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEquality;

impl<A> Equality<A> for DefaultEquality
where
    A: PartialEq + Send + Sync + 'static,
{
    fn data_eq(&self, a: &A, b: &A) -> bool {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueryError;

    fn status(data: i32) -> QueryStatus<i32> {
        QueryStatus {
            ts: 0,
            data,
            loading: false,
            error: None,
            untrusted_data: true,
        }
    }

    #[test]
    fn test_data_eq() {
        assert!(DefaultEquality.data_eq(&1, &1));
        assert!(!DefaultEquality.data_eq(&1, &2));
    }

    #[test]
    fn test_status_eq_tracks_fields() {
        let eq = DefaultEquality;
        let a = status(1);

        assert!(eq.status_eq(&a, &status(1)));
        assert!(!eq.status_eq(&a, &status(2)));

        let mut loading = status(1);
        loading.loading = true;
        assert!(!eq.status_eq(&a, &loading));
    }

    #[test]
    fn test_status_eq_errors_compare_by_identity() {
        let eq = DefaultEquality;
        let err = QueryError::msg("down");

        let mut a = status(1);
        a.error = Some(err.clone());
        let mut b = status(1);
        b.error = Some(err);
        assert!(eq.status_eq(&a, &b));

        let mut c = status(1);
        c.error = Some(QueryError::msg("down"));
        assert!(!eq.status_eq(&a, &c));
    }
}
