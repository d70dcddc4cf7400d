//! Typed query trees.
//!
//! A batched query is one logical structure shared by every batch element,
//! with per-element anchor entities and relations at the leaves and
//! projections. The literal notation mirrors the nested tuples produced by
//! query-structure files:
//!
//! ```text
//! ("e", [[3], [7]])                      two anchors, batch of 2
//! ("p", [5, 5], ("e", [[3], [7]]))       follow relation 5 from each anchor
//! ("i", ("p", [5], ("e", [[3]])), ("p", [2], ("e", [[9]])))
//! ```

use std::fmt;

use crate::error::{Q2PError, Result};

/// Logical operator of a query node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryTag {
    Entity,
    Projection,
    Intersection,
    Union,
    Negation,
}

impl QueryTag {
    /// Resolve a one-character tag string.
    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "e" => Ok(QueryTag::Entity),
            "p" => Ok(QueryTag::Projection),
            "i" => Ok(QueryTag::Intersection),
            "u" => Ok(QueryTag::Union),
            "n" => Ok(QueryTag::Negation),
            other => Err(Q2PError::MalformedQuery(format!(
                "unknown tag {:?} (expected one of e, p, i, u, n)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryTag::Entity => "e",
            QueryTag::Projection => "p",
            QueryTag::Intersection => "i",
            QueryTag::Union => "u",
            QueryTag::Negation => "n",
        }
    }
}

impl fmt::Display for QueryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A batched structured query.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredQuery {
    /// Anchor entities, one per batch element.
    Entity { anchors: Vec<usize> },

    /// Follow `relations[b]` from the answers of `query` for batch element b.
    Projection {
        relations: Vec<usize>,
        query: Box<StructuredQuery>,
    },

    /// Conjunction of two or more sub-queries.
    Intersection(Vec<StructuredQuery>),

    /// Disjunction of two or more sub-queries.
    Union(Vec<StructuredQuery>),

    /// Complement of a sub-query.
    Negation(Box<StructuredQuery>),
}

impl StructuredQuery {
    /// Create an anchor node.
    pub fn entity(anchors: Vec<usize>) -> Self {
        StructuredQuery::Entity { anchors }
    }

    /// Project this query through one relation per batch element.
    pub fn project(self, relations: Vec<usize>) -> Self {
        StructuredQuery::Projection {
            relations,
            query: Box::new(self),
        }
    }

    pub fn and(queries: Vec<StructuredQuery>) -> Self {
        StructuredQuery::Intersection(queries)
    }

    pub fn or(queries: Vec<StructuredQuery>) -> Self {
        StructuredQuery::Union(queries)
    }

    pub fn not(self) -> Self {
        StructuredQuery::Negation(Box::new(self))
    }

    pub fn tag(&self) -> QueryTag {
        match self {
            StructuredQuery::Entity { .. } => QueryTag::Entity,
            StructuredQuery::Projection { .. } => QueryTag::Projection,
            StructuredQuery::Intersection(_) => QueryTag::Intersection,
            StructuredQuery::Union(_) => QueryTag::Union,
            StructuredQuery::Negation(_) => QueryTag::Negation,
        }
    }

    /// Nesting depth; an anchor has depth 1.
    pub fn depth(&self) -> usize {
        match self {
            StructuredQuery::Entity { .. } => 1,
            StructuredQuery::Projection { query, .. } => 1 + query.depth(),
            StructuredQuery::Negation(query) => 1 + query.depth(),
            StructuredQuery::Intersection(queries) | StructuredQuery::Union(queries) => {
                1 + queries.iter().map(|q| q.depth()).max().unwrap_or(0)
            }
        }
    }

    /// Batch-free shape of the query, e.g. `(i,(p,(e)),(p,(e)))`.
    ///
    /// Queries with the same structure can be batched together.
    pub fn structure(&self) -> String {
        match self {
            StructuredQuery::Entity { .. } => "(e)".to_string(),
            StructuredQuery::Projection { query, .. } => format!("(p,{})", query.structure()),
            StructuredQuery::Negation(query) => format!("(n,{})", query.structure()),
            StructuredQuery::Intersection(queries) | StructuredQuery::Union(queries) => {
                let parts: Vec<String> = queries.iter().map(|q| q.structure()).collect();
                format!("({},{})", self.tag(), parts.join(","))
            }
        }
    }

    /// Check arity and batch consistency, returning the batch size.
    pub fn batch_size(&self) -> Result<usize> {
        match self {
            StructuredQuery::Entity { anchors } => {
                if anchors.is_empty() {
                    return Err(Q2PError::MalformedQuery(
                        "entity node with an empty batch".into(),
                    ));
                }
                Ok(anchors.len())
            }
            StructuredQuery::Projection { relations, query } => {
                if relations.is_empty() {
                    return Err(Q2PError::MalformedQuery(
                        "projection node with an empty relation batch".into(),
                    ));
                }
                let inner = query.batch_size()?;
                if inner != relations.len() {
                    return Err(Q2PError::BatchMismatch {
                        expected: relations.len(),
                        got: inner,
                    });
                }
                Ok(inner)
            }
            StructuredQuery::Negation(query) => query.batch_size(),
            StructuredQuery::Intersection(queries) | StructuredQuery::Union(queries) => {
                if queries.len() < 2 {
                    return Err(Q2PError::MalformedQuery(format!(
                        "'{}' needs at least 2 sub-queries, got {}",
                        self.tag(),
                        queries.len()
                    )));
                }
                let expected = queries[0].batch_size()?;
                for q in &queries[1..] {
                    let got = q.batch_size()?;
                    if got != expected {
                        return Err(Q2PError::BatchMismatch { expected, got });
                    }
                }
                Ok(expected)
            }
        }
    }

    /// Visit every anchor id in the tree.
    pub fn entity_ids(&self) -> Vec<usize> {
        let mut ids = Vec::new();
        self.collect_ids(&mut ids, &mut Vec::new());
        ids
    }

    /// Visit every relation id in the tree.
    pub fn relation_ids(&self) -> Vec<usize> {
        let mut ids = Vec::new();
        self.collect_ids(&mut Vec::new(), &mut ids);
        ids
    }

    fn collect_ids(&self, entities: &mut Vec<usize>, relations: &mut Vec<usize>) {
        match self {
            StructuredQuery::Entity { anchors } => entities.extend_from_slice(anchors),
            StructuredQuery::Projection {
                relations: rels,
                query,
            } => {
                relations.extend_from_slice(rels);
                query.collect_ids(entities, relations);
            }
            StructuredQuery::Negation(query) => query.collect_ids(entities, relations),
            StructuredQuery::Intersection(queries) | StructuredQuery::Union(queries) => {
                for q in queries {
                    q.collect_ids(entities, relations);
                }
            }
        }
    }
}

fn write_ids(f: &mut fmt::Formatter<'_>, ids: &[usize], nested: bool) -> fmt::Result {
    write!(f, "[")?;
    for (i, id) in ids.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        if nested {
            write!(f, "[{}]", id)?;
        } else {
            write!(f, "{}", id)?;
        }
    }
    write!(f, "]")
}

/// Prints the literal form accepted by [`crate::parse_query`].
impl fmt::Display for StructuredQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuredQuery::Entity { anchors } => {
                write!(f, "(\"e\", ")?;
                write_ids(f, anchors, true)?;
                write!(f, ")")
            }
            StructuredQuery::Projection { relations, query } => {
                write!(f, "(\"p\", ")?;
                write_ids(f, relations, false)?;
                write!(f, ", {})", query)
            }
            StructuredQuery::Negation(query) => write!(f, "(\"n\", {})", query),
            StructuredQuery::Intersection(queries) | StructuredQuery::Union(queries) => {
                write!(f, "(\"{}\"", self.tag())?;
                for q in queries {
                    write!(f, ", {}", q)?;
                }
                write!(f, ")")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_hop() -> StructuredQuery {
        StructuredQuery::entity(vec![3, 4]).project(vec![5, 5]).project(vec![1, 2])
    }

    #[test]
    fn test_tag_roundtrip() {
        for tag in ["e", "p", "i", "u", "n"] {
            assert_eq!(QueryTag::from_tag(tag).unwrap().as_str(), tag);
        }
        assert!(matches!(
            QueryTag::from_tag("x"),
            Err(Q2PError::MalformedQuery(_))
        ));
    }

    #[test]
    fn test_structure_and_depth() {
        let q = StructuredQuery::and(vec![two_hop(), StructuredQuery::entity(vec![0, 1]).not()]);
        assert_eq!(q.structure(), "(i,(p,(p,(e))),(n,(e)))");
        assert_eq!(q.depth(), 4);
    }

    #[test]
    fn test_batch_size_consistent() {
        assert_eq!(two_hop().batch_size().unwrap(), 2);
    }

    #[test]
    fn test_batch_size_mismatch() {
        let q = StructuredQuery::or(vec![
            StructuredQuery::entity(vec![1]),
            StructuredQuery::entity(vec![1, 2]),
        ]);
        assert!(matches!(
            q.batch_size(),
            Err(Q2PError::BatchMismatch { expected: 1, got: 2 })
        ));

        let q = StructuredQuery::entity(vec![1, 2]).project(vec![0]);
        assert!(matches!(q.batch_size(), Err(Q2PError::BatchMismatch { .. })));
    }

    #[test]
    fn test_arity_errors() {
        let single = StructuredQuery::and(vec![StructuredQuery::entity(vec![1])]);
        assert!(matches!(single.batch_size(), Err(Q2PError::MalformedQuery(_))));

        let empty = StructuredQuery::entity(vec![]);
        assert!(matches!(empty.batch_size(), Err(Q2PError::MalformedQuery(_))));
    }

    #[test]
    fn test_collect_ids() {
        let q = StructuredQuery::and(vec![two_hop(), StructuredQuery::entity(vec![8, 9])]);
        assert_eq!(q.entity_ids(), vec![3, 4, 8, 9]);
        assert_eq!(q.relation_ids(), vec![1, 2, 5, 5]);
    }

    #[test]
    fn test_display_literal() {
        let q = StructuredQuery::entity(vec![3]).project(vec![5]);
        assert_eq!(q.to_string(), "(\"p\", [5], (\"e\", [[3]]))");
    }
}
