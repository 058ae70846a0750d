//! Implicit dependency injection for chain-typed workflows.
//!
//! After an ordered step list is built, each step gains a dependency on
//! every step of the immediately preceding group. Explicit dependencies
//! are preserved, steps that declared an explicitly empty `depends:` are
//! left alone, and a predecessor already named by either of its
//! identifiers (ID or name) is never added twice.

use trellis_core::step::Step;

pub(crate) fn inject_chain_dependencies(steps: &mut [Step], groups: &[Vec<usize>]) {
    for window in groups.windows(2) {
        let (prev_group, group) = (&window[0], &window[1]);
        let predecessors: Vec<(String, String)> = prev_group
            .iter()
            .filter_map(|&i| steps.get(i))
            .map(|s| (s.name.clone(), s.id.clone()))
            .collect();

        for &index in group {
            let Some(step) = steps.get_mut(index) else {
                continue;
            };
            if step.explicitly_no_deps {
                continue;
            }
            for (name, id) in &predecessors {
                let present = step
                    .depends
                    .iter()
                    .any(|dep| dep == name || (!id.is_empty() && dep == id));
                if !present {
                    step.depends
                        .push(if id.is_empty() { name.clone() } else { id.clone() });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn single_groups(n: usize) -> Vec<Vec<usize>> {
        (0..n).map(|i| vec![i]).collect()
    }

    #[test]
    fn test_linear_chain() {
        let mut steps = vec![step("a"), step("b"), step("c")];
        inject_chain_dependencies(&mut steps, &single_groups(3));
        assert!(steps[0].depends.is_empty());
        assert_eq!(steps[1].depends, vec!["a"]);
        assert_eq!(steps[2].depends, vec!["b"]);
    }

    #[test]
    fn test_sibling_groups() {
        let mut steps = vec![step("a"), step("b"), step("c")];
        let groups = vec![vec![0, 1], vec![2]];
        inject_chain_dependencies(&mut steps, &groups);
        assert!(steps[0].depends.is_empty());
        assert!(steps[1].depends.is_empty());
        assert_eq!(steps[2].depends, vec!["a", "b"]);
    }

    #[test]
    fn test_injection_is_idempotent() {
        let mut steps = vec![step("a"), step("b")];
        let groups = single_groups(2);
        inject_chain_dependencies(&mut steps, &groups);
        let after_first = steps[1].depends.clone();
        inject_chain_dependencies(&mut steps, &groups);
        assert_eq!(steps[1].depends, after_first);
    }

    #[test]
    fn test_alternate_identifier_not_duplicated() {
        let mut a = step("a");
        a.id = "first".to_string();
        let mut b = step("b");
        // Already depends on the predecessor by name; the id must not be
        // appended as well.
        b.depends = vec!["a".to_string()];
        let mut steps = vec![a, b];
        inject_chain_dependencies(&mut steps, &single_groups(2));
        assert_eq!(steps[1].depends, vec!["a"]);
    }

    #[test]
    fn test_explicit_empty_deps_honoured() {
        let mut b = step("b");
        b.explicitly_no_deps = true;
        let mut steps = vec![step("a"), b];
        inject_chain_dependencies(&mut steps, &single_groups(2));
        assert!(steps[1].depends.is_empty());
    }

    #[test]
    fn test_preferred_identifier_used_for_injection() {
        let mut a = step("a");
        a.id = "first".to_string();
        let mut steps = vec![a, step("b")];
        inject_chain_dependencies(&mut steps, &single_groups(2));
        assert_eq!(steps[1].depends, vec!["first"]);
    }
}
