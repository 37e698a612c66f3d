//! Navigation - Cursor Movement over the Growing Tree
//!
//! `advance` and `retreat` relocate a tree's cursor. Advancing may grow
//! the tree (invoking the current step's growth function exactly once);
//! retreating never removes anything - branches are monotonic, so a
//! backward move is a pure cursor relocation.

use crate::arena::{StepId, Tree};
use crate::error::NavigationError;

/// Move the cursor one step forward.
///
/// Preference order: explicit `next` override, the step's (possibly
/// freshly grown) nested branch, then the next sibling found by
/// climbing through ancestor branches. An override wins even when a
/// nested branch exists, which is what makes "skip N steps" authoring
/// work.
pub fn advance(tree: &mut Tree) -> Result<StepId, NavigationError> {
    let cur = tree.cursor();

    if let Some(target) = tree.step(cur).next_override {
        tree.set_cursor(target);
        return Ok(target);
    }

    // Grow the nested branch on first forward entry. attach_children is
    // idempotent, so a branch that already exists shields the growth
    // function from a second invocation.
    if tree.step(cur).children.is_none() {
        if let Some(growth) = tree.step(cur).growth.clone() {
            let input = tree.growth_input(cur);
            let spec = growth.call(&input).map_err(|source| NavigationError::Growth {
                position: tree.position(cur),
                source,
            })?;
            tree.attach_children(cur, spec);
            tracing::debug!(position = %tree.position(cur), "grew nested branch");
        }
    }

    if let Some(children) = tree.step(cur).children {
        // An empty grown branch contributes nothing; fall through to
        // the sibling walk.
        if let Some(&first) = tree.branch(children).steps.first() {
            tree.set_cursor(first);
            return Ok(first);
        }
    }

    // Climb: nearest ancestor branch in which we are not the last step.
    let mut at = cur;
    loop {
        let step = tree.step(at);
        let branch = tree.branch(step.branch);
        if let Some(&sibling) = branch.steps.get(step.ordinal + 1) {
            tree.set_cursor(sibling);
            return Ok(sibling);
        }
        match branch.origin {
            Some(origin) => at = origin,
            None => return Err(NavigationError::NoForward(tree.position(cur))),
        }
    }
}

/// Move the cursor one step back.
///
/// Preference order: explicit `prev` override, the previous sibling
/// (descending into its deepest grown sub-tree, so that retreating
/// mirrors the climb `advance` performed on the way out), then the
/// origin step of the current branch.
pub fn retreat(tree: &mut Tree) -> Result<StepId, NavigationError> {
    let cur = tree.cursor();

    if let Some(target) = tree.step(cur).prev_override {
        tree.set_cursor(target);
        return Ok(target);
    }

    let step = tree.step(cur);
    let branch = tree.branch(step.branch);

    if step.ordinal > 0 {
        let mut at = branch.steps[step.ordinal - 1];
        while let Some(children) = tree.step(at).children {
            match tree.branch(children).steps.last() {
                Some(&last) => at = last,
                None => break,
            }
        }
        tree.set_cursor(at);
        return Ok(at);
    }

    match branch.origin {
        Some(origin) => {
            tree.set_cursor(origin);
            Ok(origin)
        }
        None => Err(NavigationError::NoBackward(tree.position(cur))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::{BranchSpec, GrowthFn, StepSpec};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn linear(labels: &[&str]) -> BranchSpec {
        labels
            .iter()
            .fold(BranchSpec::new(), |b, l| b.step(StepSpec::new(*l)))
    }

    fn label(tree: &Tree) -> &str {
        &tree.current().label
    }

    #[test]
    fn linear_flow_advances_to_terminal_then_errors() {
        let spec = BranchSpec::new()
            .step(StepSpec::new("a"))
            .step(StepSpec::new("b"))
            .step(StepSpec::new("c").terminal());
        let mut tree = Tree::new(spec).unwrap();

        assert_eq!(label(&tree), "a");
        advance(&mut tree).unwrap();
        assert_eq!(label(&tree), "b");
        advance(&mut tree).unwrap();
        assert_eq!(label(&tree), "c");
        assert!(tree.current().terminal);
        assert!(matches!(
            advance(&mut tree),
            Err(NavigationError::NoForward(_))
        ));
        // Failed advance leaves the cursor in place.
        assert_eq!(label(&tree), "c");
    }

    #[test]
    fn retreat_from_first_step_errors() {
        let mut tree = Tree::new(linear(&["a", "b"])).unwrap();
        assert!(matches!(
            retreat(&mut tree),
            Err(NavigationError::NoBackward(_))
        ));
    }

    #[test]
    fn growth_is_invoked_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").grow(GrowthFn::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(linear(&["x", "y"]))
            })))
            .step(StepSpec::new("b").terminal());
        let mut tree = Tree::new(spec).unwrap();

        advance(&mut tree).unwrap();
        assert_eq!(label(&tree), "x");
        let x = tree.cursor();

        retreat(&mut tree).unwrap();
        assert_eq!(label(&tree), "a");
        advance(&mut tree).unwrap();

        // Same step object, not a freshly grown twin.
        assert_eq!(tree.cursor(), x);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn advance_climbs_out_of_exhausted_branch() {
        let spec = BranchSpec::new()
            .step(
                StepSpec::new("a").grow(GrowthFn::new(|_| Ok(linear(&["x", "y"])))),
            )
            .step(StepSpec::new("b").terminal());
        let mut tree = Tree::new(spec).unwrap();

        advance(&mut tree).unwrap(); // a -> x
        advance(&mut tree).unwrap(); // x -> y
        advance(&mut tree).unwrap(); // y climbs out to b
        assert_eq!(label(&tree), "b");
    }

    #[test]
    fn round_trip_law_without_overrides() {
        let spec = BranchSpec::new()
            .step(
                StepSpec::new("a").grow(GrowthFn::new(|_| Ok(linear(&["x", "y"])))),
            )
            .step(StepSpec::new("b").terminal());
        let mut tree = Tree::new(spec).unwrap();

        // Exercise every structural advance flavor: descend, sibling,
        // climb-out. Each must be undone by a single retreat.
        loop {
            let before = tree.cursor();
            if advance(&mut tree).is_err() {
                break;
            }
            let after = tree.cursor();
            retreat(&mut tree).unwrap();
            assert_eq!(tree.cursor(), before, "retreat(advance) broke at {after:?}");
            tree.set_cursor(after);
        }
    }

    #[test]
    fn next_override_wins_over_children() {
        let spec = BranchSpec::new()
            .step(
                StepSpec::new("a").grow(GrowthFn::new(|_| Ok(linear(&["x"])))),
            )
            .step(StepSpec::new("b"))
            .step(StepSpec::new("c").terminal());
        let mut tree = Tree::new(spec).unwrap();
        let root = tree.root();
        let a = tree.branch(root).steps[0];
        let c = tree.branch(root).steps[2];
        tree.set_next_override(a, c);

        advance(&mut tree).unwrap();
        assert_eq!(label(&tree), "c");
        // Children were neither grown nor entered.
        assert!(tree.step(a).children.is_none());
    }

    #[test]
    fn prev_override_jumps_across_branches() {
        let spec = BranchSpec::new()
            .step(StepSpec::new("a"))
            .step(StepSpec::new("b"))
            .step(StepSpec::new("c").terminal());
        let mut tree = Tree::new(spec).unwrap();
        let root = tree.root();
        let a = tree.branch(root).steps[0];
        let c = tree.branch(root).steps[2];
        tree.set_prev_override(c, a);

        tree.set_cursor(c);
        retreat(&mut tree).unwrap();
        assert_eq!(label(&tree), "a");
    }

    #[test]
    fn empty_grown_branch_falls_through_to_sibling() {
        let spec = BranchSpec::new()
            .step(StepSpec::new("a").grow(GrowthFn::new(|_| Ok(BranchSpec::new()))))
            .step(StepSpec::new("b").terminal());
        let mut tree = Tree::new(spec).unwrap();

        advance(&mut tree).unwrap();
        assert_eq!(label(&tree), "b");
    }
}
