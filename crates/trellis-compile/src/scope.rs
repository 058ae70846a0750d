//! Layered variable scope for build-time evaluation.
//!
//! The scope stacks environment sources from least to most specific:
//! OS snapshot → dotenv files → caller-provided build env → workflow env →
//! step env. Accumulated parameters sit above every layer. Lookups walk
//! most-specific → least-specific. The process environment is captured once
//! at build start and never written back.

/// Origin of one scope layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarSource {
    Os,
    DotEnv,
    BuildEnv,
    DagEnv,
    StepEnv,
}

#[derive(Debug, Clone)]
struct Layer {
    source: VarSource,
    vars: Vec<(String, String)>,
}

/// The layered environment passed to the evaluator.
#[derive(Debug, Clone)]
pub struct EnvScope {
    layers: Vec<Layer>,
    /// Named parameters accumulated during param evaluation. These beat
    /// every layer.
    params: Vec<(String, String)>,
}

impl EnvScope {
    /// Create a scope whose base layer is a snapshot of the process
    /// environment.
    pub fn with_os_snapshot() -> Self {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        Self {
            layers: vec![Layer {
                source: VarSource::Os,
                vars,
            }],
            params: Vec::new(),
        }
    }

    /// Create an empty scope (tests, no-OS evaluation).
    pub fn empty() -> Self {
        Self {
            layers: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Append a layer of variables tagged with their source.
    pub fn push_layer(&mut self, source: VarSource, vars: Vec<(String, String)>) {
        self.layers.push(Layer { source, vars });
    }

    /// Define one variable in the topmost layer of the given source,
    /// creating the layer when absent.
    pub fn define(&mut self, source: VarSource, name: impl Into<String>, value: impl Into<String>) {
        let entry = (name.into(), value.into());
        match self.layers.iter_mut().rev().find(|l| l.source == source) {
            Some(layer) => layer.vars.push(entry),
            None => self.push_layer(source, vec![entry]),
        }
    }

    /// Publish an evaluated parameter so later values can reference it.
    pub fn define_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.params.push((name.into(), value.into()));
    }

    /// Look up a variable, most-specific source first.
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if let Some(value) = find_last(&self.params, name) {
            return Some(value);
        }
        for layer in self.layers.iter().rev() {
            if let Some(value) = find_last(&layer.vars, name) {
                return Some(value);
            }
        }
        None
    }

}

fn find_last<'a>(vars: &'a [(String, String)], name: &str) -> Option<&'a str> {
    vars.iter()
        .rev()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_specific_layer_wins() {
        let mut scope = EnvScope::empty();
        scope.push_layer(VarSource::Os, vec![("HOME".into(), "/root".into())]);
        scope.push_layer(VarSource::DotEnv, vec![("HOME".into(), "/opt".into())]);
        scope.push_layer(VarSource::DagEnv, vec![("HOME".into(), "/work".into())]);
        assert_eq!(scope.lookup("HOME"), Some("/work"));
    }

    #[test]
    fn test_params_beat_layers() {
        let mut scope = EnvScope::empty();
        scope.push_layer(VarSource::DagEnv, vec![("NAME".into(), "layered".into())]);
        scope.define_param("NAME", "param");
        assert_eq!(scope.lookup("NAME"), Some("param"));
    }

    #[test]
    fn test_later_entries_win_within_layer() {
        let mut scope = EnvScope::empty();
        scope.define(VarSource::DagEnv, "A", "1");
        scope.define(VarSource::DagEnv, "A", "2");
        assert_eq!(scope.lookup("A"), Some("2"));
    }

    #[test]
    fn test_missing_is_none() {
        let scope = EnvScope::empty();
        assert_eq!(scope.lookup("NOPE"), None);
    }
}
