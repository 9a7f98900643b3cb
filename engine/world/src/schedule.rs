//! Update-function ordering: topological sort over declared dependencies
//! within each phase, ties broken by priority (higher first)

use common::*;

use crate::component::{UpdateFunctionDesc, UpdatePhase};

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Cyclic update-function dependency involving {0:?}")]
    DependencyCycle(String),

    #[error("Update function {0:?} depends on unknown function {1:?}")]
    UnknownDependency(String, String),
}

#[derive(Clone, Debug)]
pub(crate) struct ScheduledFn {
    pub manager_index: usize,
    pub desc: UpdateFunctionDesc,
}

#[derive(Default)]
pub(crate) struct Schedule {
    phases: [Vec<ScheduledFn>; 4],
}

pub(crate) fn phase_index(phase: UpdatePhase) -> usize {
    match phase {
        UpdatePhase::PreAsync => 0,
        UpdatePhase::Async => 1,
        UpdatePhase::PostAsync => 2,
        UpdatePhase::PostTransform => 3,
    }
}

impl Schedule {
    pub fn phase(&self, phase: UpdatePhase) -> &[ScheduledFn] {
        &self.phases[phase_index(phase)]
    }

    /// Builds the per-phase orders from every manager's declared functions.
    /// `functions` pairs each desc with the index of its owning manager
    pub fn build(functions: &[(usize, UpdateFunctionDesc)]) -> Result<Schedule, ScheduleError> {
        let mut schedule = Schedule::default();

        for phase in [
            UpdatePhase::PreAsync,
            UpdatePhase::Async,
            UpdatePhase::PostAsync,
            UpdatePhase::PostTransform,
        ] {
            let in_phase: Vec<&(usize, UpdateFunctionDesc)> = functions
                .iter()
                .filter(|(_, desc)| desc.phase == phase)
                .collect();

            let order = topo_sort(&in_phase)?;
            schedule.phases[phase_index(phase)] = order;
        }

        Ok(schedule)
    }
}

fn topo_sort(
    functions: &[&(usize, UpdateFunctionDesc)],
) -> Result<Vec<ScheduledFn>, ScheduleError> {
    let name_to_index = |name: &str| functions.iter().position(|(_, d)| d.name == name);

    // dependency edges may point at functions in other phases; those are
    // already ordered by the phase barrier and are ignored here
    let mut blocked_by: Vec<Vec<usize>> = vec![Vec::new(); functions.len()];
    for (idx, (_, desc)) in functions.iter().enumerate() {
        for dep in &desc.depends_on {
            if let Some(dep_idx) = name_to_index(dep) {
                blocked_by[idx].push(dep_idx);
            }
        }
    }

    let mut done = vec![false; functions.len()];
    let mut order = Vec::with_capacity(functions.len());

    while order.len() < functions.len() {
        // highest-priority ready function next; stable by name for determinism
        let next = functions
            .iter()
            .enumerate()
            .filter(|(idx, _)| !done[*idx])
            .filter(|(idx, _)| blocked_by[*idx].iter().all(|dep| done[*dep]))
            .max_by(|(_, (_, a)), (_, (_, b))| {
                a.priority
                    .partial_cmp(&b.priority)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.name.cmp(&a.name))
            });

        match next {
            Some((idx, (manager_index, desc))) => {
                done[idx] = true;
                order.push(ScheduledFn {
                    manager_index: *manager_index,
                    desc: desc.clone(),
                });
            }
            None => {
                let stuck = functions
                    .iter()
                    .enumerate()
                    .find(|(idx, _)| !done[*idx])
                    .map(|(_, (_, d))| d.name.clone())
                    .unwrap_or_default();
                return Err(ScheduleError::DependencyCycle(stuck));
            }
        }
    }

    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(name: &str, phase: UpdatePhase) -> UpdateFunctionDesc {
        UpdateFunctionDesc::new(name, phase)
    }

    #[test]
    fn dependencies_order_before_priority() {
        // Update depends on Update2 and Update3; Update3 has the highest
        // priority overall
        let functions = vec![
            (0, {
                let mut d = desc("Update", UpdatePhase::PreAsync);
                d.depends_on = vec!["Update2".to_owned(), "Update3".to_owned()];
                d
            }),
            (0, desc("Update2", UpdatePhase::PreAsync)),
            (0, desc("Update3", UpdatePhase::PreAsync).priority(1000.0)),
            (0, desc("AUpdate3", UpdatePhase::PreAsync).priority(1000.0)),
        ];

        let schedule = Schedule::build(&functions).unwrap();
        let names: Vec<&str> = schedule
            .phase(UpdatePhase::PreAsync)
            .iter()
            .map(|f| f.desc.name.as_str())
            .collect();

        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("Update2") < pos("Update"));
        assert!(pos("Update3") < pos("Update"));
        // priority 1000 funcs lead the phase
        assert_eq!(pos("Update3").min(pos("AUpdate3")), 0);
    }

    #[test]
    fn cycles_are_a_configuration_error() {
        let functions = vec![
            (0, {
                let mut d = desc("A", UpdatePhase::PreAsync);
                d.depends_on = vec!["B".to_owned()];
                d
            }),
            (0, {
                let mut d = desc("B", UpdatePhase::PreAsync);
                d.depends_on = vec!["A".to_owned()];
                d
            }),
        ];

        assert!(matches!(
            Schedule::build(&functions),
            Err(ScheduleError::DependencyCycle(_))
        ));
    }

    #[test]
    fn phases_are_independent() {
        let functions = vec![
            (0, desc("pre", UpdatePhase::PreAsync)),
            (1, desc("async", UpdatePhase::Async)),
            (2, desc("post", UpdatePhase::PostTransform)),
        ];

        let schedule = Schedule::build(&functions).unwrap();
        assert_eq!(schedule.phase(UpdatePhase::PreAsync).len(), 1);
        assert_eq!(schedule.phase(UpdatePhase::Async).len(), 1);
        assert_eq!(schedule.phase(UpdatePhase::PostAsync).len(), 0);
        assert_eq!(schedule.phase(UpdatePhase::PostTransform).len(), 1);
    }
}
