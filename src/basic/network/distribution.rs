//! Spreading of an active power mismatch over generators or loads.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{BASE_MVA, LfNetwork};

/// Active power residue: 1e-5 p.u., i.e. 1e-3 MW.
pub const P_RESIDUE_EPS: f64 = 1e-5;

/// Generators whose maximum active power exceeds this value (p.u.) are not
/// considered for distribution.
pub const PLAUSIBLE_ACTIVE_POWER_LIMIT: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceType {
    #[default]
    ProportionalToGenerationPMax,
    ProportionalToLoad,
    ProportionalToConformLoad,
}

/// A generator (or a bus load when `generator` is `None`) taking part in the
/// distribution, with its participation factor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParticipatingElement {
    pub bus: usize,
    pub generator: Option<usize>,
    pub factor: f64,
}

fn normalize_participation_factors(elements: &mut [ParticipatingElement], element_type: &str) {
    let sum: f64 = elements.iter().map(|e| e.factor).sum();
    if sum == 0.0 {
        debug!("zero participation sum for {} elements", element_type);
        return;
    }
    for element in elements.iter_mut() {
        element.factor /= sum;
    }
}

/// One pass of a distribution strategy.
pub trait ActivePowerDistributionStep {
    fn element_type(&self) -> &'static str;

    fn participating_elements(&self, network: &LfNetwork) -> Vec<ParticipatingElement>;

    /// Moves part of `remaining_mismatch` to the elements and returns the
    /// amount that was actually distributed. Elements that hit a limit are
    /// removed from `elements`.
    fn run(
        &self,
        network: &mut LfNetwork,
        elements: &mut Vec<ParticipatingElement>,
        iteration: usize,
        remaining_mismatch: f64,
    ) -> f64;
}

/// Distribution proportional to the maximum active power of the generators.
#[derive(Debug, Default, Clone)]
pub struct GenerationActivePowerDistributionStep;

impl ActivePowerDistributionStep for GenerationActivePowerDistributionStep {
    fn element_type(&self) -> &'static str {
        "generator"
    }

    fn participating_elements(&self, network: &LfNetwork) -> Vec<ParticipatingElement> {
        let mut elements = Vec::new();
        for bus in network.buses().iter().filter(|b| !b.disabled) {
            for (i, generator) in bus.generators.iter().enumerate() {
                let max_p = generator.p_limit.max;
                if generator.participating && max_p > 0.0 && max_p < PLAUSIBLE_ACTIVE_POWER_LIMIT {
                    elements.push(ParticipatingElement {
                        bus: bus.num,
                        generator: Some(i),
                        factor: max_p,
                    });
                }
            }
        }
        elements
    }

    fn run(
        &self,
        network: &mut LfNetwork,
        elements: &mut Vec<ParticipatingElement>,
        iteration: usize,
        remaining_mismatch: f64,
    ) -> f64 {
        normalize_participation_factors(elements, self.element_type());

        let mut done = 0.0;
        let mut modified = 0;
        let mut at_limit = 0;
        elements.retain(|element| {
            let Some(generator) = element
                .generator
                .and_then(|g| network.bus_mut(element.bus).ok()?.generators.get_mut(g))
            else {
                return false;
            };
            let target_p = generator.target_p;
            let mut new_target_p = target_p + remaining_mismatch * element.factor;
            let mut keep = true;
            if new_target_p >= generator.p_limit.max || new_target_p <= generator.p_limit.min {
                new_target_p = generator.p_limit.clamp(new_target_p);
                at_limit += 1;
                keep = false;
            }
            if new_target_p != target_p {
                trace!(
                    "rescale '{}' active power target: {} -> {}",
                    generator.id,
                    target_p * BASE_MVA,
                    new_target_p * BASE_MVA
                );
                generator.target_p = new_target_p;
                done += new_target_p - target_p;
                modified += 1;
            }
            keep
        });

        debug!(
            "{} MW / {} MW distributed at iteration {} to {} generators ({} at max power)",
            done * BASE_MVA,
            remaining_mismatch * BASE_MVA,
            iteration,
            modified,
            at_limit
        );
        done
    }
}

/// Distribution over bus loads, optionally restricted to the conforming
/// part and optionally keeping the load power factor.
#[derive(Debug, Clone)]
pub struct LoadActivePowerDistributionStep {
    pub distributed_on_conform_load: bool,
    pub load_power_factor_constant: bool,
}

impl LoadActivePowerDistributionStep {
    fn variable_load_target_p(&self, bus: &super::LfBus) -> f64 {
        if self.distributed_on_conform_load {
            bus.variable_load_target_p()
        } else {
            bus.load_target_p
        }
    }
}

impl ActivePowerDistributionStep for LoadActivePowerDistributionStep {
    fn element_type(&self) -> &'static str {
        "load"
    }

    fn participating_elements(&self, network: &LfNetwork) -> Vec<ParticipatingElement> {
        network
            .buses()
            .iter()
            .filter(|bus| {
                bus.load_count > 0
                    && self.variable_load_target_p(bus) > 0.0
                    && !(bus.fictitious || bus.disabled)
            })
            .map(|bus| ParticipatingElement {
                bus: bus.num,
                generator: None,
                factor: self.variable_load_target_p(bus),
            })
            .collect()
    }

    fn run(
        &self,
        network: &mut LfNetwork,
        elements: &mut Vec<ParticipatingElement>,
        iteration: usize,
        remaining_mismatch: f64,
    ) -> f64 {
        // some loads may have reached their minimum and been removed
        normalize_participation_factors(elements, self.element_type());

        let mut done = 0.0;
        let mut modified = 0;
        let mut at_min = 0;
        elements.retain(|element| {
            let Ok(bus) = network.bus_mut(element.bus) else {
                return false;
            };
            let load_target_p = bus.load_target_p;
            let mut new_load_target_p = load_target_p - remaining_mismatch * element.factor;
            let min_load_target_p = if self.distributed_on_conform_load {
                bus.fixed_load_target_p
            } else {
                0.0
            };
            let mut keep = true;
            if new_load_target_p <= min_load_target_p {
                new_load_target_p = min_load_target_p;
                at_min += 1;
                keep = false;
            }
            if new_load_target_p != load_target_p {
                trace!(
                    "rescale '{}' active power target: {} -> {}",
                    bus.id,
                    load_target_p * BASE_MVA,
                    new_load_target_p * BASE_MVA
                );
                if self.load_power_factor_constant && load_target_p != 0.0 {
                    let ratio = bus.load_target_q / load_target_p;
                    bus.load_target_q = new_load_target_p * ratio;
                }
                bus.load_target_p = new_load_target_p;
                done += load_target_p - new_load_target_p;
                modified += 1;
            }
            keep
        });

        debug!(
            "{} MW / {} MW distributed at iteration {} to {} loads ({} at min consumption)",
            done * BASE_MVA,
            -remaining_mismatch * BASE_MVA,
            iteration,
            modified,
            at_min
        );
        done
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DistributionResult {
    pub iteration: usize,
    pub remaining_mismatch: f64,
}

pub struct ActivePowerDistribution {
    step: Box<dyn ActivePowerDistributionStep>,
}

impl ActivePowerDistribution {
    pub fn new(balance_type: BalanceType, load_power_factor_constant: bool) -> Self {
        let step: Box<dyn ActivePowerDistributionStep> = match balance_type {
            BalanceType::ProportionalToGenerationPMax => Box::new(GenerationActivePowerDistributionStep),
            BalanceType::ProportionalToLoad => Box::new(LoadActivePowerDistributionStep {
                distributed_on_conform_load: false,
                load_power_factor_constant,
            }),
            BalanceType::ProportionalToConformLoad => Box::new(LoadActivePowerDistributionStep {
                distributed_on_conform_load: true,
                load_power_factor_constant,
            }),
        };
        Self { step }
    }

    pub fn element_type(&self) -> &'static str {
        self.step.element_type()
    }

    /// Distributes `mismatch` until it is below [`P_RESIDUE_EPS`] or no
    /// element can take more.
    pub fn run(&self, network: &mut LfNetwork, mismatch: f64) -> DistributionResult {
        let mut elements = self.step.participating_elements(network);
        let mut iteration = 0;
        let mut remaining_mismatch = mismatch;
        while !elements.is_empty() && remaining_mismatch.abs() > P_RESIDUE_EPS {
            let done = self.step.run(network, &mut elements, iteration, remaining_mismatch);
            remaining_mismatch -= done;
            iteration += 1;
            if done == 0.0 {
                break;
            }
        }
        DistributionResult {
            iteration,
            remaining_mismatch,
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::basic::network::{LfBus, LfGenerator};

    fn network() -> LfNetwork {
        let mut network = LfNetwork::new(0);
        network.add_bus(
            LfBus::new("g1")
                .with_slack()
                .with_generator(LfGenerator::new("g1", 1.0).with_p_limit(0.0, 3.0)),
        );
        network.add_bus(
            LfBus::new("g2")
                .with_generator(LfGenerator::new("g2", 0.5).with_p_limit(0.0, 1.0))
                .with_load(2.0, 1.0),
        );
        network.add_bus(LfBus {
            fixed_load_target_p: 0.5,
            ..LfBus::new("l").with_load(1.0, 0.2)
        });
        network
    }

    #[test]
    fn test_generation_proportional_to_pmax() {
        let mut network = network();
        let result = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax, false)
            .run(&mut network, 0.4);
        assert_abs_diff_eq!(result.remaining_mismatch, 0.0, epsilon = P_RESIDUE_EPS);
        assert_abs_diff_eq!(network.buses()[0].generators[0].target_p, 1.3, epsilon = 1e-9);
        assert_abs_diff_eq!(network.buses()[1].generators[0].target_p, 0.6, epsilon = 1e-9);
    }

    #[test]
    fn test_generation_hits_limits() {
        let mut network = network();
        // g2 saturates at 1.0 on the first pass, g1 takes the rest
        let result = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax, false)
            .run(&mut network, 2.4);
        assert!(result.iteration >= 2);
        assert_abs_diff_eq!(result.remaining_mismatch, 0.0, epsilon = P_RESIDUE_EPS);
        assert_abs_diff_eq!(network.buses()[1].generators[0].target_p, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(network.buses()[0].generators[0].target_p, 2.9, epsilon = 1e-9);

        // nothing left to give
        let result = ActivePowerDistribution::new(BalanceType::ProportionalToGenerationPMax, false)
            .run(&mut network, 5.0);
        assert!(result.remaining_mismatch > 4.0);
    }

    #[test]
    fn test_conform_load_with_constant_power_factor() {
        let mut network = network();
        let result = ActivePowerDistribution::new(BalanceType::ProportionalToConformLoad, true)
            .run(&mut network, 0.25);
        assert_abs_diff_eq!(result.remaining_mismatch, 0.0, epsilon = P_RESIDUE_EPS);
        // variable parts are 2.0 and 0.5
        assert_abs_diff_eq!(network.buses()[1].load_target_p, 1.8, epsilon = 1e-9);
        assert_abs_diff_eq!(network.buses()[1].load_target_q, 0.9, epsilon = 1e-9);
        assert_abs_diff_eq!(network.buses()[2].load_target_p, 0.95, epsilon = 1e-9);
    }
}
