//! Dependency graph over catalog entity types.
//!
//! Derives, from the catalog's declared relations, which types a given type
//! depends on (directly or transitively) and a topological ranking that the
//! scheduler uses to order fetches. Self-referencing relations are excluded
//! here; blocking on them would deadlock a type against itself.

use std::collections::HashSet;

use crate::bail;
use crate::catalog::{Catalog, EntityTypeId};
use crate::error::{ErrorKind, SyncResult};

/// Directed acyclic dependency graph with a precomputed topological ranking.
#[derive(Debug)]
pub struct DependencyGraph {
    /// Direct dependencies per entity type, indexed by id.
    direct: Vec<HashSet<EntityTypeId>>,
    /// Rank sets: every dependency of a type lies in a strictly earlier rank.
    ranks: Vec<Vec<EntityTypeId>>,
}

impl DependencyGraph {
    /// Builds the graph and its topological ranking from the catalog.
    ///
    /// A dependency cycle is a construction-time error naming the entangled
    /// types.
    pub fn build(catalog: &Catalog) -> SyncResult<Self> {
        let mut direct = vec![HashSet::new(); catalog.len()];
        for relation in catalog.relations() {
            if relation.is_self_referencing() {
                continue;
            }
            direct[relation.dependent.index()].insert(relation.principal);
        }

        let ranks = rank(catalog, &direct)?;

        Ok(Self { direct, ranks })
    }

    /// Direct dependencies of an entity type.
    pub fn direct_dependencies(&self, id: EntityTypeId) -> &HashSet<EntityTypeId> {
        &self.direct[id.index()]
    }

    /// Direct and indirect dependencies of an entity type.
    pub fn transitive_dependencies(&self, id: EntityTypeId) -> HashSet<EntityTypeId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<EntityTypeId> = self.direct[id.index()].iter().copied().collect();

        while let Some(dependency) = stack.pop() {
            if seen.insert(dependency) {
                stack.extend(self.direct[dependency.index()].iter().copied());
            }
        }

        seen
    }

    /// Topological rank sets, dependencies strictly before dependents.
    pub fn ranks(&self) -> &[Vec<EntityTypeId>] {
        &self.ranks
    }
}

/// Kahn-style ranking: peel off everything whose dependencies are already
/// ranked, one rank set per round.
fn rank(
    catalog: &Catalog,
    direct: &[HashSet<EntityTypeId>],
) -> SyncResult<Vec<Vec<EntityTypeId>>> {
    let mut ranks = Vec::new();
    let mut ranked: HashSet<EntityTypeId> = HashSet::new();
    let mut remaining: Vec<EntityTypeId> = catalog.iter().map(|(id, _)| id).collect();

    while !remaining.is_empty() {
        let mut current: Vec<EntityTypeId> = remaining
            .iter()
            .copied()
            .filter(|id| direct[id.index()].is_subset(&ranked))
            .collect();

        if current.is_empty() {
            let mut entangled: Vec<&str> = remaining
                .iter()
                .map(|id| catalog.entity_type(*id).name.as_str())
                .collect();
            entangled.sort_unstable();

            bail!(
                ErrorKind::DependencyCycle,
                "Dependency cycle between entity types",
                format!("no valid ordering exists among: {}", entangled.join(", "))
            );
        }

        current.sort_unstable();
        ranked.extend(current.iter().copied());
        remaining.retain(|id| !ranked.contains(id));
        ranks.push(current);
    }

    Ok(ranks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;
    use crate::catalog::{EntityType, FieldSchema, FieldType, Multiplicity, RelationDef};

    fn entity(name: &str) -> EntityType {
        EntityType {
            name: name.to_string(),
            fields: vec![
                FieldSchema {
                    name: "ID".to_string(),
                    ty: FieldType::Int32,
                    nullable: false,
                },
                FieldSchema {
                    name: "OtherID".to_string(),
                    ty: FieldType::Int32,
                    nullable: true,
                },
            ],
            key_fields: vec!["ID".to_string()],
        }
    }

    fn relation(name: &str, dependent: &str, principal: &str) -> RelationDef {
        RelationDef {
            name: name.to_string(),
            dependent: dependent.to_string(),
            principal: principal.to_string(),
            dependent_fields: vec!["OtherID".to_string()],
            principal_fields: vec!["ID".to_string()],
            principal_multiplicity: Multiplicity::ExactlyOne,
        }
    }

    #[test]
    fn ranks_respect_dependencies() {
        let catalog = parliament_catalog();
        let graph = DependencyGraph::build(&catalog).unwrap();

        let party = catalog.resolve("Party").unwrap();
        let member = catalog.resolve("Member").unwrap();
        let vote = catalog.resolve("Vote").unwrap();

        let rank_of = |id: EntityTypeId| {
            graph
                .ranks()
                .iter()
                .position(|rank| rank.contains(&id))
                .unwrap()
        };

        assert!(rank_of(party) < rank_of(member));
        assert!(rank_of(member) < rank_of(vote));
    }

    #[test]
    fn transitive_dependencies_cover_the_chain() {
        let catalog = parliament_catalog();
        let graph = DependencyGraph::build(&catalog).unwrap();

        let party = catalog.resolve("Party").unwrap();
        let member = catalog.resolve("Member").unwrap();
        let vote = catalog.resolve("Vote").unwrap();

        assert_eq!(
            graph.transitive_dependencies(vote),
            [party, member].into_iter().collect()
        );
        assert!(graph.transitive_dependencies(party).is_empty());
    }

    #[test]
    fn cycle_fails_construction() {
        let catalog = Catalog::new(
            vec![entity("A"), entity("B")],
            vec![relation("fk_a_b", "A", "B"), relation("fk_b_a", "B", "A")],
        )
        .unwrap();

        let err = DependencyGraph::build(&catalog).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DependencyCycle);
        assert!(err.detail().unwrap().contains("A, B"));
    }

    #[test]
    fn self_reference_does_not_block() {
        let catalog = Catalog::new(
            vec![entity("Tree")],
            vec![relation("fk_tree_parent", "Tree", "Tree")],
        )
        .unwrap();

        let graph = DependencyGraph::build(&catalog).unwrap();
        let tree = catalog.resolve("Tree").unwrap();

        assert!(graph.direct_dependencies(tree).is_empty());
        assert_eq!(graph.ranks().len(), 1);
    }
}
