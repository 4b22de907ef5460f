//! DAG construction and next-runnable-service resolution.

use std::collections::{HashMap, HashSet};

use parley_types::{OrchestratorError, Result};

use super::descriptor::ServiceDescriptor;

/// The resolved, validated pipeline DAG.
///
/// Construction computes, for every service, its predecessor closure
/// and the reverse (`next`) edges, then validates the graph is acyclic
/// and carries exactly one `input` and at least one `responder` tag.
pub struct Pipeline {
    services: HashMap<String, ServiceDescriptor>,
    /// `next(s)`: services with `s` in their `previous` or
    /// `required_previous` set.
    next: HashMap<String, Vec<String>>,
    /// Stable topological rank, used only to break ties in
    /// `next_services`.
    rank: HashMap<String, usize>,
    input_service: String,
}

impl Pipeline {
    /// Validate and assemble a pipeline from its resolved services.
    pub fn new(services: Vec<ServiceDescriptor>) -> Result<Self> {
        let mut by_name: HashMap<String, ServiceDescriptor> = HashMap::new();
        for svc in services {
            by_name.insert(svc.name.clone(), svc);
        }

        let inputs: Vec<&String> = by_name
            .values()
            .filter(|s| s.is_input())
            .map(|s| &s.name)
            .collect();
        if inputs.len() != 1 {
            return Err(OrchestratorError::ConfigInvalid {
                reason: format!(
                    "pipeline must declare exactly one `input` service, found {}",
                    inputs.len()
                ),
            });
        }
        let input_service = inputs[0].clone();

        if !by_name.values().any(|s| s.is_responder()) {
            return Err(OrchestratorError::ConfigInvalid {
                reason: "pipeline must declare at least one `responder` service".into(),
            });
        }

        for svc in by_name.values() {
            for pred in svc.previous.iter().chain(svc.required_previous.iter()) {
                if !by_name.contains_key(pred) {
                    return Err(OrchestratorError::ConfigInvalid {
                        reason: format!(
                            "service `{}` declares unknown predecessor `{}`",
                            svc.name, pred
                        ),
                    });
                }
            }
        }

        let rank = topological_rank(&by_name)?;

        let mut next: HashMap<String, Vec<String>> =
            by_name.keys().map(|k| (k.clone(), Vec::new())).collect();
        for svc in by_name.values() {
            for pred in svc.previous.iter().chain(svc.required_previous.iter()) {
                next.get_mut(pred).unwrap().push(svc.name.clone());
            }
        }

        Ok(Self {
            services: by_name,
            next,
            rank,
            input_service,
        })
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDescriptor> {
        self.services.get(name)
    }

    pub fn input_service(&self) -> &str {
        &self.input_service
    }

    /// The name of the service tagged `timeout`, if the pipeline
    /// declares one.
    pub fn timeout_service_name(&self) -> Option<String> {
        self.services.values().find(|s| s.is_timeout()).map(|s| s.name.clone())
    }

    /// Services immediately downstream of `name` (its `next` edges).
    pub fn next_of(&self, name: &str) -> &[String] {
        self.next.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The transitive closure of `next_of`, used to cascade a skip.
    pub fn dependents_of(&self, name: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack: Vec<&str> = self.next_of(name).iter().map(String::as_str).collect();
        while let Some(s) = stack.pop() {
            if seen.insert(s.to_string()) {
                stack.extend(self.next_of(s).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Every service runnable given the current `(done, waiting,
    /// skipped)` partition: not already accounted for, every
    /// `required_previous` done, every `previous` done or skipped.
    /// Tie-broken by topological rank then name for a stable order.
    pub fn next_services(
        &self,
        done: &HashSet<String>,
        waiting: &HashSet<String>,
        skipped: &HashSet<String>,
    ) -> Vec<String> {
        let mut runnable: Vec<&String> = self
            .services
            .keys()
            .filter(|name| {
                if done.contains(*name) || waiting.contains(*name) || skipped.contains(*name) {
                    return false;
                }
                let svc = &self.services[*name];
                let required_ok = svc.required_previous.iter().all(|p| done.contains(p));
                let soft_ok = svc
                    .previous
                    .iter()
                    .all(|p| done.contains(p) || skipped.contains(p));
                required_ok && soft_ok
            })
            .collect();

        runnable.sort_by_key(|name| (self.rank[*name], (*name).clone()));
        runnable.into_iter().cloned().collect()
    }
}

fn topological_rank(services: &HashMap<String, ServiceDescriptor>) -> Result<HashMap<String, usize>> {
    let mut in_degree: HashMap<&str, usize> = services.keys().map(|k| (k.as_str(), 0)).collect();
    let mut forward: HashMap<&str, Vec<&str>> = services.keys().map(|k| (k.as_str(), Vec::new())).collect();

    for svc in services.values() {
        for pred in svc.previous.iter().chain(svc.required_previous.iter()) {
            forward.get_mut(pred.as_str()).unwrap().push(svc.name.as_str());
            *in_degree.get_mut(svc.name.as_str()).unwrap() += 1;
        }
    }

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(name, _)| *name)
        .collect();
    ready.sort();

    let mut rank = HashMap::new();
    let mut order = 0usize;
    let mut queue = ready;
    while let Some(name) = queue.pop() {
        rank.insert(name.to_string(), order);
        order += 1;
        let mut newly_ready = Vec::new();
        for succ in &forward[name] {
            let deg = in_degree.get_mut(succ).unwrap();
            *deg -= 1;
            if *deg == 0 {
                newly_ready.push(*succ);
            }
        }
        newly_ready.sort();
        queue.extend(newly_ready);
        queue.sort();
        queue.reverse();
    }

    if rank.len() != services.len() {
        return Err(OrchestratorError::ConfigInvalid {
            reason: "pipeline dependency graph contains a cycle".into(),
        });
    }

    Ok(rank)
}
