use crate::{
    config::{ContainersConfig, NicsConfig},
    error::{ConfigError, ResourceError},
    template::Placeholders,
    value_domain::ValueDomain,
};
use itertools::Itertools;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicAssignment {
    pub name: String,
    pub ip: String,
    pub netmask: u8,
    /// Core that handles the NIC's IRQs.
    pub irq_core: Option<usize>,
}

/// The exclusive resources of one execution unit for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceAssignment {
    pub unit_index: usize,
    pub cores: Vec<usize>,
    pub nic: Option<NicAssignment>,
    pub port: Option<u16>,
}
impl ResourceAssignment {
    /// Cores in `taskset`/`cpuset` list form, e.g. `4,5,6`.
    pub fn core_list(&self) -> String {
        self.cores.iter().join(",")
    }
}

/// Assignments for every unit index the sweep can reach. Built and validated once, before
/// any unit is started, so that a campaign never launches partially.
#[derive(Debug, Clone)]
pub struct ResourcePlan {
    assignments: Vec<ResourceAssignment>,
}
impl ResourcePlan {
    pub fn new(
        containers: &ContainersConfig,
        nics: Option<&NicsConfig>,
        max_units: usize,
        available_cores: usize,
    ) -> Result<Self, ResourceError> {
        let core_count = containers.core_count;
        let offsets = match &containers.core_affinity_offsets {
            Some(spec) => to_indices("core_affinity_offsets", spec.expand()?)?,
            None => (0..max_units).map(|i| core_count * i).collect(),
        };
        debug!("Core affinity offsets: {:?}", offsets);
        if offsets.len() < max_units {
            return Err(ResourceError::InsufficientCores {
                units: max_units,
                available: offsets.len(),
            });
        }

        let nic_domains = match nics {
            Some(nics) => Some(NicDomains::new(nics, max_units)?),
            None => None,
        };

        let mut owners: HashMap<usize, usize> = HashMap::new();
        let mut assignments = Vec::with_capacity(max_units);
        for (unit, offset) in offsets.iter().take(max_units).enumerate() {
            let cores = (*offset..*offset + core_count).collect_vec();
            for core in cores.iter() {
                if *core >= available_cores {
                    return Err(ResourceError::CoreOutOfRange {
                        core: *core,
                        unit,
                        available: available_cores,
                    });
                }
                if let Some(first) = owners.insert(*core, unit) {
                    return Err(ResourceError::OverlappingCores {
                        core: *core,
                        first,
                        second: unit,
                    });
                }
            }

            let nic = match &nic_domains {
                Some(domains) => Some(domains.assignment(unit)?),
                None => None,
            };

            let port = match containers.port {
                Some(base) => Some(
                    u16::try_from(unit)
                        .ok()
                        .and_then(|i| base.checked_add(i))
                        .ok_or(ResourceError::PortOutOfRange { base, unit })?,
                ),
                None => None,
            };

            assignments.push(ResourceAssignment {
                unit_index: unit,
                cores,
                nic,
                port,
            });
        }

        Ok(ResourcePlan { assignments })
    }

    /// The assignments of the first `unit_count` units.
    pub fn assign(&self, unit_count: usize) -> Result<&[ResourceAssignment], ResourceError> {
        if unit_count > self.assignments.len() {
            return Err(ResourceError::InsufficientCores {
                units: unit_count,
                available: self.assignments.len(),
            });
        }
        Ok(&self.assignments[..unit_count])
    }

    pub fn capacity(&self) -> usize {
        self.assignments.len()
    }
}

struct NicDomains<'a> {
    config: &'a NicsConfig,
    ips: ValueDomain<String>,
    irq_cores: Option<Vec<usize>>,
}
impl<'a> NicDomains<'a> {
    fn new(config: &'a NicsConfig, max_units: usize) -> Result<Self, ResourceError> {
        let ips = config.ips.expand_strings()?;
        if ips.len() < max_units {
            return Err(ResourceError::InsufficientIps {
                units: max_units,
                available: ips.len(),
            });
        }
        let mut seen = HashSet::new();
        if let Some(ip) = ips.iter().find(|ip| !seen.insert(ip.as_str())) {
            return Err(ResourceError::DuplicateIp { ip: ip.clone() });
        }

        let irq_cores = match &config.core_affinity_offsets {
            Some(spec) => {
                let cores = to_indices("nics.core_affinity_offsets", spec.expand()?)?;
                if cores.len() < max_units {
                    return Err(ResourceError::InsufficientIrqCores {
                        units: max_units,
                        available: cores.len(),
                    });
                }
                Some(cores)
            }
            None => None,
        };

        Ok(NicDomains {
            config,
            ips,
            irq_cores,
        })
    }

    fn assignment(&self, unit: usize) -> Result<NicAssignment, ResourceError> {
        let name = Placeholders::new()
            .with("i", unit)
            .render(&self.config.nic_format)?;
        // both lengths were checked against max_units in `new`
        let ip = self.ips.get(unit).cloned().unwrap_or_default();
        let irq_core = self
            .irq_cores
            .as_ref()
            .and_then(|cores| cores.get(unit).copied());

        Ok(NicAssignment {
            name,
            ip,
            netmask: self.config.netmask,
            irq_core,
        })
    }
}

fn to_indices(field: &str, domain: ValueDomain<i64>) -> Result<Vec<usize>, ConfigError> {
    domain
        .iter()
        .map(|v| {
            usize::try_from(*v)
                .map_err(|_| ConfigError::Invalid(format!("{} must not be negative: {}", field, v)))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value_domain::DomainSpec;

    fn containers(core_count: usize, offsets: Option<Vec<i64>>) -> ContainersConfig {
        ContainersConfig {
            core_count,
            core_affinity_offsets: offsets.map(DomainSpec::literal),
            ..Default::default()
        }
    }

    fn nics(ips: Vec<i64>, irq: Option<Vec<i64>>) -> NicsConfig {
        NicsConfig {
            nic_format: "eth{i}".to_string(),
            ips: DomainSpec::literal(ips).with_format("10.0.0.{i}"),
            netmask: 24,
            core_affinity_offsets: irq.map(DomainSpec::literal),
        }
    }

    fn assert_disjoint(assignments: &[ResourceAssignment]) {
        let mut seen = HashSet::new();
        for a in assignments {
            for core in a.cores.iter() {
                assert!(seen.insert(*core), "core {} assigned twice", core);
            }
        }
    }

    #[test]
    fn default_offsets_are_disjoint() -> anyhow::Result<()> {
        let plan = ResourcePlan::new(&containers(3, None), None, 4, 64)?;
        for units in 1..=4 {
            let assigned = plan.assign(units)?;
            assert_eq!(assigned.len(), units);
            assert_disjoint(assigned);
        }
        let assigned = plan.assign(4)?;
        assert_eq!(assigned[0].cores, vec![0, 1, 2]);
        assert_eq!(assigned[3].cores, vec![9, 10, 11]);
        assert_eq!(assigned[1].core_list(), "3,4,5");
        Ok(())
    }

    #[test]
    fn override_offsets_are_used_in_order() -> anyhow::Result<()> {
        let plan = ResourcePlan::new(&containers(2, Some(vec![8, 4, 12])), None, 3, 64)?;
        let assigned = plan.assign(3)?;
        assert_eq!(assigned[0].cores, vec![4, 5]);
        assert_eq!(assigned[1].cores, vec![8, 9]);
        assert_eq!(assigned[2].cores, vec![12, 13]);
        Ok(())
    }

    #[test]
    fn short_override_list_is_exhaustion() {
        let res = ResourcePlan::new(&containers(1, Some(vec![0, 1])), None, 3, 64);
        assert!(matches!(
            res,
            Err(ResourceError::InsufficientCores {
                units: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn overlapping_override_is_rejected() {
        let res = ResourcePlan::new(&containers(4, Some(vec![0, 2])), None, 2, 64);
        assert!(matches!(res, Err(ResourceError::OverlappingCores { .. })));
    }

    #[test]
    fn cores_beyond_the_machine_are_rejected() {
        let res = ResourcePlan::new(&containers(2, None), None, 3, 4);
        assert!(matches!(res, Err(ResourceError::CoreOutOfRange { core: 4, .. })));
    }

    #[test]
    fn nics_get_distinct_ips_in_order() -> anyhow::Result<()> {
        let nics = nics(vec![3, 1, 2], Some(vec![30, 31, 32]));
        let plan = ResourcePlan::new(&containers(1, None), Some(&nics), 3, 64)?;
        let assigned = plan.assign(3)?;

        let ips = assigned
            .iter()
            .map(|a| a.nic.as_ref().map(|n| n.ip.clone()).unwrap_or_default())
            .collect_vec();
        assert_eq!(ips, vec!["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let nic = assigned[2].nic.as_ref().expect("nic should be assigned");
        assert_eq!(nic.name, "eth2");
        assert_eq!(nic.netmask, 24);
        assert_eq!(nic.irq_core, Some(32));
        Ok(())
    }

    #[test]
    fn too_few_ips_fail_before_anything_starts() {
        let nics = nics(vec![1, 2], None);
        let res = ResourcePlan::new(&containers(1, None), Some(&nics), 3, 64);
        assert!(matches!(
            res,
            Err(ResourceError::InsufficientIps {
                units: 3,
                available: 2
            })
        ));
    }

    #[test]
    fn too_few_irq_cores_fail() {
        let nics = nics(vec![1, 2, 3], Some(vec![20]));
        let res = ResourcePlan::new(&containers(1, None), Some(&nics), 2, 64);
        assert!(matches!(res, Err(ResourceError::InsufficientIrqCores { .. })));
    }

    #[test]
    fn constant_ip_template_is_a_duplicate() {
        let mut nics = nics(vec![1, 2], None);
        nics.ips = DomainSpec::literal(vec![1, 2]).with_format("10.0.0.1");
        let res = ResourcePlan::new(&containers(1, None), Some(&nics), 2, 64);
        assert!(matches!(res, Err(ResourceError::DuplicateIp { .. })));
    }

    #[test]
    fn requesting_more_units_than_planned_fails() -> anyhow::Result<()> {
        let plan = ResourcePlan::new(&containers(1, None), None, 2, 64)?;
        assert!(plan.assign(3).is_err());
        Ok(())
    }

    #[test]
    fn ports_increase_with_unit_index() -> anyhow::Result<()> {
        let mut cfg = containers(1, None);
        cfg.port = Some(6379);
        let plan = ResourcePlan::new(&cfg, None, 3, 64)?;
        let ports = plan.assign(3)?.iter().map(|a| a.port).collect_vec();
        assert_eq!(ports, vec![Some(6379), Some(6380), Some(6381)]);
        Ok(())
    }
}
