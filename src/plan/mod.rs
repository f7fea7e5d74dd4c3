// Plan Rewriter (C5): walks a planned query tree, tracks the fragmentation
// of each subtree, and inserts Exchange nodes so joins, aggregates, and
// inserts see correctly partitioned inputs.
//
// `PlanNode` stands in for the real relational executor's plan-tree node
// types (out of scope per §1/§6); it carries exactly the shape this
// rewriter needs to walk and remap attribute numbers.

use crate::catalog::FragCatalog;
use crate::common::{AttrNo, FragSpec, FuncId};
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Hash,
    Merge,
    NestedLoop,
}

/// Routing mode an inserted Exchange node will run under (mirrors
/// `exchange::RouteMode`; kept as a separate, plan-time-only type since the
/// rewriter never touches live connections).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeMode {
    RouteByFunc,
    Broadcast,
    DropDuplicatesRoute,
}

/// Which side of a join an output targetlist entry was projected from, used
/// to remap a join's `FragSpec.attno` after rewriting (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinSide {
    Outer,
    Inner,
}

#[derive(Debug, Clone)]
pub enum PlanNode {
    SeqScan {
        relation: String,
    },
    /// `from_values`: the source is a row constructor / constant values
    /// list rather than a scan (drives `DropDuplicatesRoute` vs.
    /// `RouteByFunc` below the insert).
    Insert {
        relation: String,
        input: Box<PlanNode>,
        from_values: bool,
    },
    /// `is_final: false` is the partial-aggregate stage that needs its
    /// input broadcast so every node sees every partial.
    ///
    /// `init_plan`: uncorrelated-subquery initialization carried on this
    /// node, reattached here (rather than dropped) when this `Aggregate` is
    /// the rewriter's root and so never gets wrapped in a gather `Exchange`
    /// (see `rewrite`'s `root_is_aggregate` branch).
    Aggregate {
        input: Box<PlanNode>,
        is_final: bool,
        init_plan: Option<Box<PlanNode>>,
    },
    Join {
        kind: JoinKind,
        outer: Box<PlanNode>,
        inner: Box<PlanNode>,
        /// Join attribute on the outer side, or `None` if the join uses
        /// more than one attribute per side (§4.5's `oj < 0`).
        outer_attr: Option<AttrNo>,
        inner_attr: Option<AttrNo>,
        /// `(side, attno)` pairs for the join's output targetlist, in
        /// output position order, used to remap `FragSpec.attno`.
        output_targets: Vec<(JoinSide, AttrNo)>,
    },
    /// Any unary pass-through node (Filter/Project/Sort/Limit/...). The
    /// default rule (§4.5) applies: propagate the child's spec unchanged.
    PassThrough {
        input: Box<PlanNode>,
    },
    /// An Exchange node spliced in by the rewriter. Never present in the
    /// rewriter's input; only ever produced as output.
    Exchange {
        input: Box<PlanNode>,
        mode: ExchangeMode,
        spec: FragSpec,
        /// Uncorrelated-subquery initialization moved here from the
        /// original root when this Exchange is the spliced root gather
        /// (§4.5's `initPlan` handling).
        init_plan: Option<Box<PlanNode>>,
    },
}

impl PlanNode {
    fn is_aggregate(&self) -> bool {
        matches!(self, PlanNode::Aggregate { .. })
    }
}

/// The planned query tree handed to the rewriter, with any uncorrelated
/// subquery initialization carried alongside the root.
pub struct Plan {
    pub root: PlanNode,
    pub init_plan: Option<Box<PlanNode>>,
}

/// Remap a `FragSpec`'s `attno` to the first output-targetlist position
/// that references `(side, old_attno)`, or leave it `UNINITIALIZED` if no
/// such entry exists — e.g. a `Var` with `varattno <= 0` (whole-row/system
/// column), which is always skipped during attribute analysis.
fn remap_join_attno(
    targets: &[(JoinSide, AttrNo)],
    side: JoinSide,
    old_attno: AttrNo,
) -> Option<AttrNo> {
    if old_attno <= 0 {
        return None;
    }
    targets
        .iter()
        .position(|&(s, a)| s == side && a == old_attno)
        .map(|pos| (pos + 1) as AttrNo)
}

/// Post-order recursion computing each subtree's `FragSpec` and inserting
/// Exchange nodes per §4.5's rules. Returns the rewritten subtree and its
/// resulting fragmentation.
fn rewrite_node(node: PlanNode, catalog: &FragCatalog) -> Result<(PlanNode, FragSpec)> {
    match node {
        PlanNode::SeqScan { relation } => {
            let spec = catalog.lookup_or_replicated(&relation);
            Ok((PlanNode::SeqScan { relation }, spec))
        }

        PlanNode::Insert {
            relation,
            input,
            from_values,
        } => {
            let (input, _input_spec) = rewrite_node(*input, catalog)?;
            let dest_spec = catalog.lookup_or_replicated(&relation);
            let mode = if from_values {
                ExchangeMode::DropDuplicatesRoute
            } else {
                ExchangeMode::RouteByFunc
            };
            let exchange = PlanNode::Exchange {
                input: Box::new(input),
                mode,
                spec: dest_spec,
                init_plan: None,
            };
            let node = PlanNode::Insert {
                relation,
                input: Box::new(exchange),
                from_values,
            };
            // An insert's own output is not scanned further; its spec is
            // irrelevant to its parent (there normally is none).
            Ok((node, FragSpec::UNINITIALIZED))
        }

        PlanNode::Aggregate {
            input,
            is_final,
            init_plan,
        } => {
            let (input, _input_spec) = rewrite_node(*input, catalog)?;
            let input = if is_final {
                input
            } else {
                PlanNode::Exchange {
                    input: Box::new(input),
                    mode: ExchangeMode::Broadcast,
                    spec: FragSpec::UNINITIALIZED,
                    init_plan: None,
                }
            };
            let node = PlanNode::Aggregate {
                input: Box::new(input),
                is_final,
                init_plan,
            };
            Ok((node, FragSpec::UNINITIALIZED))
        }

        PlanNode::Join {
            kind,
            outer,
            inner,
            outer_attr,
            inner_attr,
            output_targets,
        } => {
            let (outer, outer_spec) = rewrite_node(*outer, catalog)?;
            let (inner, inner_spec) = rewrite_node(*inner, catalog)?;

            if outer_spec.is_uninitialized() || inner_spec.is_uninitialized() {
                // Join with a replicated/system relation: no redistribution.
                let node = PlanNode::Join {
                    kind,
                    outer: Box::new(outer),
                    inner: Box::new(inner),
                    outer_attr,
                    inner_attr,
                    output_targets,
                };
                return Ok((node, FragSpec::UNINITIALIZED));
            }

            let (outer, inner, result_side, result_old_attno, result_spec) =
                match (outer_attr, inner_attr) {
                    (Some(oj), Some(ij)) if outer_spec.attno == oj && outer_spec.func_id
                        == inner_spec.func_id
                        && inner_spec.attno == ij =>
                    {
                        // Already co-located under the same function.
                        (outer, inner, JoinSide::Outer, oj, outer_spec)
                    }
                    (Some(oj), Some(ij)) if outer_spec.attno == oj => {
                        // Outer distributed by oj but function differs from
                        // inner's by ij: redistribute inner to match outer.
                        let redistributed = PlanNode::Exchange {
                            input: Box::new(inner),
                            mode: ExchangeMode::RouteByFunc,
                            spec: outer_spec.with_attno(ij),
                            init_plan: None,
                        };
                        (outer, redistributed, JoinSide::Outer, oj, outer_spec)
                    }
                    (Some(oj), Some(ij)) if inner_spec.attno == ij => {
                        // Inner distributed by ij, outer not by oj:
                        // redistribute outer to match inner.
                        let redistributed = PlanNode::Exchange {
                            input: Box::new(outer),
                            mode: ExchangeMode::RouteByFunc,
                            spec: inner_spec.with_attno(oj),
                            init_plan: None,
                        };
                        (redistributed, inner, JoinSide::Inner, ij, inner_spec)
                    }
                    (Some(oj), Some(ij)) => {
                        // Neither side aligned: redistribute inner by
                        // outer's function at the inner join attribute.
                        let redistributed = PlanNode::Exchange {
                            input: Box::new(inner),
                            mode: ExchangeMode::RouteByFunc,
                            spec: outer_spec.with_attno(ij),
                            init_plan: None,
                        };
                        (outer, redistributed, JoinSide::Outer, oj, outer_spec)
                    }
                    _ => {
                        // Multi-attribute join (ij < 0 or oj < 0 in the
                        // original notation): broadcast the inner, keep the
                        // outer in place.
                        let broadcast = PlanNode::Exchange {
                            input: Box::new(inner),
                            mode: ExchangeMode::Broadcast,
                            spec: FragSpec::UNINITIALIZED,
                            init_plan: None,
                        };
                        let oattno = outer_spec.attno;
                        (outer, broadcast, JoinSide::Outer, oattno, outer_spec)
                    }
                };

            let remapped_attno =
                remap_join_attno(&output_targets, result_side, result_old_attno);
            let final_spec = match remapped_attno {
                Some(attno) => result_spec.with_attno(attno),
                None => FragSpec::UNINITIALIZED,
            };

            let node = PlanNode::Join {
                kind,
                outer: Box::new(outer),
                inner: Box::new(inner),
                outer_attr,
                inner_attr,
                output_targets,
            };
            Ok((node, final_spec))
        }

        PlanNode::PassThrough { input } => {
            let (input, spec) = rewrite_node(*input, catalog)?;
            Ok((PlanNode::PassThrough { input: Box::new(input) }, spec))
        }

        PlanNode::Exchange { .. } => Err(DbError::Execution(
            "plan rewriter received an already-rewritten tree".to_string(),
        )),
    }
}

/// Rewrite a full plan, then splice a root GATHER Exchange unless the root
/// is itself an Aggregate (whose output is already replicated across every
/// node by construction).
pub fn rewrite(plan: Plan, catalog: &FragCatalog) -> Result<PlanNode> {
    let root_is_aggregate = plan.root.is_aggregate();
    let Plan { root, init_plan } = plan;
    let (root, _spec) = rewrite_node(root, catalog)?;

    if root_is_aggregate {
        // No gather Exchange is spliced above an aggregate root (its output
        // is already replicated across every node), so there is no spliced
        // node to move initPlan onto. PostgreSQL's own planner hook doesn't
        // move anything here either: it simply leaves the Agg node untouched
        // when its tag is T_Agg, so initPlan stays exactly where it already
        // was. Reattach it to the root for the same reason, rather than
        // dropping it.
        let root = match root {
            PlanNode::Aggregate {
                input,
                is_final,
                init_plan: existing,
            } => PlanNode::Aggregate {
                input,
                is_final,
                init_plan: existing.or(init_plan),
            },
            other => other,
        };
        return Ok(root);
    }

    // GATHER is not a distinct routing mode: it is plain RouteByFunc over a
    // FragSpec whose func_id is Gather, so `catalog::route` resolves every
    // tuple to the coordinator (see §4.6/§4.4).
    Ok(PlanNode::Exchange {
        input: Box::new(root),
        mode: ExchangeMode::RouteByFunc,
        spec: FragSpec::gather(),
        init_plan,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FragSpec;

    fn catalog_with(rows: &[(&str, FragSpec)]) -> FragCatalog {
        let cat = FragCatalog::in_memory();
        for (name, spec) in rows {
            cat.register(*name, *spec).unwrap();
        }
        cat.reload().unwrap();
        cat
    }

    #[test]
    fn seq_scan_returns_catalog_spec() {
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let (node, spec) =
            rewrite_node(PlanNode::SeqScan { relation: "t".to_string() }, &cat).unwrap();
        assert_eq!(spec, FragSpec::modulo(1));
        assert!(matches!(node, PlanNode::SeqScan { .. }));
    }

    #[test]
    fn join_on_matching_distribution_key_inserts_no_exchange() {
        let cat = catalog_with(&[
            ("u", FragSpec::modulo(1)),
            ("v", FragSpec::modulo(1)),
        ]);
        let join = PlanNode::Join {
            kind: JoinKind::Hash,
            outer: Box::new(PlanNode::SeqScan { relation: "u".to_string() }),
            inner: Box::new(PlanNode::SeqScan { relation: "v".to_string() }),
            outer_attr: Some(1),
            inner_attr: Some(1),
            output_targets: vec![(JoinSide::Outer, 1), (JoinSide::Inner, 1)],
        };
        let (node, spec) = rewrite_node(join, &cat).unwrap();
        assert_eq!(spec, FragSpec::modulo(1));
        match node {
            PlanNode::Join { outer, inner, .. } => {
                assert!(matches!(*outer, PlanNode::SeqScan { .. }));
                assert!(matches!(*inner, PlanNode::SeqScan { .. }));
            }
            _ => panic!("expected join"),
        }
    }

    #[test]
    fn join_on_non_distribution_key_redistributes_inner() {
        let cat = catalog_with(&[
            ("u", FragSpec::modulo(1)),
            ("v", FragSpec::modulo(1)),
        ]);
        // u.x = v.y, where u is distributed on attno 1 ("a") but the join
        // is on attno 2 ("x"); v is distributed on attno 1 ("c") but joined
        // on attno 2 ("y").
        let join = PlanNode::Join {
            kind: JoinKind::Hash,
            outer: Box::new(PlanNode::SeqScan { relation: "u".to_string() }),
            inner: Box::new(PlanNode::SeqScan { relation: "v".to_string() }),
            outer_attr: Some(2),
            inner_attr: Some(2),
            output_targets: vec![(JoinSide::Outer, 2), (JoinSide::Inner, 2)],
        };
        let (node, _spec) = rewrite_node(join, &cat).unwrap();
        match node {
            PlanNode::Join { inner, .. } => {
                assert!(matches!(*inner, PlanNode::Exchange { mode: ExchangeMode::RouteByFunc, .. }));
            }
            _ => panic!("expected join"),
        }
    }

    #[test]
    fn multi_attribute_join_broadcasts_inner() {
        let cat = catalog_with(&[
            ("u", FragSpec::modulo(1)),
            ("v", FragSpec::modulo(1)),
        ]);
        let join = PlanNode::Join {
            kind: JoinKind::Hash,
            outer: Box::new(PlanNode::SeqScan { relation: "u".to_string() }),
            inner: Box::new(PlanNode::SeqScan { relation: "v".to_string() }),
            outer_attr: None,
            inner_attr: None,
            output_targets: vec![(JoinSide::Outer, 1)],
        };
        let (node, _spec) = rewrite_node(join, &cat).unwrap();
        match node {
            PlanNode::Join { inner, .. } => {
                assert!(matches!(*inner, PlanNode::Exchange { mode: ExchangeMode::Broadcast, .. }));
            }
            _ => panic!("expected join"),
        }
    }

    #[test]
    fn join_with_replicated_relation_inserts_no_exchange() {
        let cat = catalog_with(&[("u", FragSpec::modulo(1))]);
        // "sys" has no catalog row: treated as UNINITIALIZED/replicated.
        let join = PlanNode::Join {
            kind: JoinKind::NestedLoop,
            outer: Box::new(PlanNode::SeqScan { relation: "u".to_string() }),
            inner: Box::new(PlanNode::SeqScan { relation: "sys".to_string() }),
            outer_attr: Some(1),
            inner_attr: Some(1),
            output_targets: vec![],
        };
        let (node, spec) = rewrite_node(join, &cat).unwrap();
        assert!(spec.is_uninitialized());
        match node {
            PlanNode::Join { inner, .. } => assert!(matches!(*inner, PlanNode::SeqScan { .. })),
            _ => panic!("expected join"),
        }
    }

    #[test]
    fn insert_from_values_uses_drop_duplicates_route() {
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let insert = PlanNode::Insert {
            relation: "t".to_string(),
            input: Box::new(PlanNode::PassThrough {
                input: Box::new(PlanNode::SeqScan { relation: "t".to_string() }),
            }),
            from_values: true,
        };
        let (node, _spec) = rewrite_node(insert, &cat).unwrap();
        match node {
            PlanNode::Insert { input, .. } => {
                assert!(matches!(
                    *input,
                    PlanNode::Exchange { mode: ExchangeMode::DropDuplicatesRoute, .. }
                ));
            }
            _ => panic!("expected insert"),
        }
    }

    #[test]
    fn partial_aggregate_is_broadcast_below() {
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let agg = PlanNode::Aggregate {
            input: Box::new(PlanNode::SeqScan { relation: "t".to_string() }),
            is_final: false,
            init_plan: None,
        };
        let (node, spec) = rewrite_node(agg, &cat).unwrap();
        assert!(spec.is_uninitialized());
        match node {
            PlanNode::Aggregate { input, .. } => {
                assert!(matches!(*input, PlanNode::Exchange { mode: ExchangeMode::Broadcast, .. }));
            }
            _ => panic!("expected aggregate"),
        }
    }

    #[test]
    fn non_aggregate_root_gets_gather_exchange() {
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let plan = Plan {
            root: PlanNode::SeqScan { relation: "t".to_string() },
            init_plan: None,
        };
        let rewritten = rewrite(plan, &cat).unwrap();
        assert!(matches!(
            rewritten,
            PlanNode::Exchange { spec, .. } if spec.func_id == FuncId::Gather
        ));
    }

    #[test]
    fn aggregate_root_does_not_get_a_second_gather() {
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let plan = Plan {
            root: PlanNode::Aggregate {
                input: Box::new(PlanNode::SeqScan { relation: "t".to_string() }),
                is_final: true,
                init_plan: None,
            },
            init_plan: None,
        };
        let rewritten = rewrite(plan, &cat).unwrap();
        assert!(matches!(rewritten, PlanNode::Aggregate { .. }));
    }

    #[test]
    fn aggregate_root_keeps_the_plans_init_plan_instead_of_dropping_it() {
        // An aggregate root never gets a spliced gather Exchange to move
        // initPlan onto (see `rewrite`'s `root_is_aggregate` branch), so the
        // uncorrelated-subquery init carried on the `Plan` itself must land
        // on the untouched Aggregate node rather than vanish.
        let cat = catalog_with(&[("t", FragSpec::modulo(1))]);
        let subquery_init = Box::new(PlanNode::SeqScan {
            relation: "uncorrelated_subquery".to_string(),
        });
        let plan = Plan {
            root: PlanNode::Aggregate {
                input: Box::new(PlanNode::SeqScan { relation: "t".to_string() }),
                is_final: true,
                init_plan: None,
            },
            init_plan: Some(subquery_init.clone()),
        };
        let rewritten = rewrite(plan, &cat).unwrap();
        match rewritten {
            PlanNode::Aggregate { init_plan, .. } => {
                assert!(matches!(
                    init_plan.as_deref(),
                    Some(PlanNode::SeqScan { relation }) if relation == "uncorrelated_subquery"
                ));
            }
            _ => panic!("expected aggregate"),
        }
    }
}
