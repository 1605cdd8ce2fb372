//! Query parameters: criteria, ordering and pagination.

use std::cmp::Ordering;

use kc_model::{SearchableEntity, SearchableField};

use crate::criteria::Criteria;
use crate::error::StorageResult;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    /// Ascending; absent values last.
    #[default]
    Ascending,
    /// Descending; absent values first.
    Descending,
}

/// One ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy<F> {
    /// Field to order by.
    pub field: F,
    /// Direction.
    pub order: Order,
}

/// Everything a backend needs to answer a search.
#[derive(Debug, Clone)]
pub struct QueryParameters<F> {
    criteria: Criteria<F>,
    order_by: Vec<OrderBy<F>>,
    offset: Option<usize>,
    limit: Option<usize>,
}

impl<F: SearchableField> Default for QueryParameters<F> {
    fn default() -> Self {
        Self::with_criteria(Criteria::new())
    }
}

impl<F: SearchableField> From<Criteria<F>> for QueryParameters<F> {
    fn from(criteria: Criteria<F>) -> Self {
        Self::with_criteria(criteria)
    }
}

impl<F: SearchableField> QueryParameters<F> {
    /// Query over `criteria`, unordered and unpaginated.
    #[must_use]
    pub const fn with_criteria(criteria: Criteria<F>) -> Self {
        Self {
            criteria,
            order_by: Vec::new(),
            offset: None,
            limit: None,
        }
    }

    /// Appends an ordering key.
    #[must_use]
    pub fn order_by(mut self, field: F, order: Order) -> Self {
        self.order_by.push(OrderBy { field, order });
        self
    }

    /// Sets pagination. `None` or a negative value means unbounded.
    #[must_use]
    pub fn pagination(mut self, first: Option<i32>, max: Option<i32>) -> Self {
        self.offset = first.and_then(|f| usize::try_from(f).ok());
        self.limit = max.and_then(|m| usize::try_from(m).ok());
        self
    }

    /// The criteria.
    #[must_use]
    pub const fn criteria(&self) -> &Criteria<F> {
        &self.criteria
    }

    /// Ordering keys, most significant first.
    #[must_use]
    pub fn ordering(&self) -> &[OrderBy<F>] {
        &self.order_by
    }

    /// Number of leading results to skip.
    #[must_use]
    pub const fn offset(&self) -> Option<usize> {
        self.offset
    }

    /// Maximum number of results.
    #[must_use]
    pub const fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// True if an offset or limit applies.
    #[must_use]
    pub const fn is_paginated(&self) -> bool {
        self.offset.is_some() || self.limit.is_some()
    }

    /// The same query without offset or limit.
    #[must_use]
    pub fn without_pagination(&self) -> Self {
        Self {
            criteria: self.criteria.clone(),
            order_by: self.order_by.clone(),
            offset: None,
            limit: None,
        }
    }

    /// Orders two entities by the ordering keys.
    #[must_use]
    pub fn compare<E: SearchableEntity<Field = F>>(&self, a: &E, b: &E) -> Ordering {
        for key in &self.order_by {
            let left = a.field_value(key.field, &[]);
            let right = b.field_value(key.field, &[]);
            let ordering = match (left.sort_key(), right.sort_key()) {
                (Some(l), Some(r)) => l.cmp(r),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = match key.order {
                Order::Ascending => ordering,
                Order::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    /// Sorts `items` stably and applies pagination.
    #[must_use]
    pub fn order_and_paginate<E: SearchableEntity<Field = F>>(&self, mut items: Vec<E>) -> Vec<E> {
        if !self.order_by.is_empty() {
            items.sort_by(|a, b| self.compare(a, b));
        }
        items
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Filters, sorts and paginates `items`.
    ///
    /// ## Errors
    ///
    /// Returns an error if the criteria are malformed.
    pub fn select<E: SearchableEntity<Field = F>>(
        &self,
        items: impl IntoIterator<Item = E>,
    ) -> StorageResult<Vec<E>> {
        self.criteria.validate()?;
        let matching = items
            .into_iter()
            .filter(|e| self.criteria.matches_unchecked(e))
            .collect();
        Ok(self.order_and_paginate(matching))
    }
}
