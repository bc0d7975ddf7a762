use std::collections::BTreeMap;

use crate::bucket::Bucket;

/// Per-bucket emission targets derived from a profile's weights and the total
/// budget. The planner knows nothing about availability; shortfalls are the
/// sampler's problem.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MixPlan {
    pub targets: BTreeMap<Bucket, u64>,
}

impl MixPlan {
    pub fn total(&self) -> u64 {
        self.targets.values().sum()
    }
}

/// Largest-remainder apportionment: floor every target, then hand the
/// remaining units to the buckets with the largest fractional parts.
/// Remainder ties break in taxonomy order.
pub fn plan_targets(weights: &BTreeMap<Bucket, f64>, total_budget: u64) -> MixPlan {
    let sum: f64 = weights.values().filter(|w| w.is_finite() && **w > 0.0).sum();
    if sum <= 0.0 || total_budget == 0 {
        return MixPlan::default();
    }

    let mut targets: BTreeMap<Bucket, u64> = BTreeMap::new();
    let mut fractions: Vec<(Bucket, f64)> = Vec::with_capacity(weights.len());
    let mut assigned: u64 = 0;

    for (bucket, weight) in weights {
        if !weight.is_finite() || *weight <= 0.0 {
            continue;
        }
        let exact = weight / sum * total_budget as f64;
        let floor = exact.floor() as u64;
        assigned = assigned.saturating_add(floor);
        targets.insert(*bucket, floor);
        fractions.push((*bucket, exact - floor as f64));
    }

    let mut remainder = total_budget.saturating_sub(assigned);
    fractions.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal).then(a.0.cmp(&b.0)));
    for (bucket, _) in fractions {
        if remainder == 0 {
            break;
        }
        if let Some(t) = targets.get_mut(&bucket) {
            *t += 1;
            remainder -= 1;
        }
    }

    MixPlan { targets }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn even_split() {
        let weights = BTreeMap::from([(Bucket::Code, 0.5), (Bucket::CotMath, 0.5)]);
        let plan = plan_targets(&weights, 10);
        assert_eq!(plan.targets.get(&Bucket::Code), Some(&5));
        assert_eq!(plan.targets.get(&Bucket::CotMath), Some(&5));
        assert_eq!(plan.total(), 10);
    }

    #[test]
    fn remainder_goes_to_largest_fractions() {
        let weights = BTreeMap::from([
            (Bucket::Instruction, 1.0),
            (Bucket::Code, 1.0),
            (Bucket::Creative, 1.0),
        ]);
        let plan = plan_targets(&weights, 10);
        assert_eq!(plan.total(), 10);
        // Equal fractions: the tie breaks in taxonomy order, so instruction
        // gets the extra unit.
        assert_eq!(plan.targets.get(&Bucket::Instruction), Some(&4));
        assert_eq!(plan.targets.get(&Bucket::Code), Some(&3));
        assert_eq!(plan.targets.get(&Bucket::Creative), Some(&3));
    }

    #[test]
    fn weights_need_not_sum_to_one() {
        let weights = BTreeMap::from([(Bucket::Code, 3.0), (Bucket::Factual, 1.0)]);
        let plan = plan_targets(&weights, 100);
        assert_eq!(plan.targets.get(&Bucket::Code), Some(&75));
        assert_eq!(plan.targets.get(&Bucket::Factual), Some(&25));
    }

    #[test]
    fn zero_weight_buckets_are_skipped() {
        let weights = BTreeMap::from([(Bucket::Code, 1.0), (Bucket::Factual, 0.0)]);
        let plan = plan_targets(&weights, 7);
        assert_eq!(plan.targets.get(&Bucket::Code), Some(&7));
        assert_eq!(plan.targets.get(&Bucket::Factual), None);
    }

    #[test]
    fn empty_budget_or_weights() {
        assert_eq!(plan_targets(&BTreeMap::new(), 10).total(), 0);
        let weights = BTreeMap::from([(Bucket::Code, 1.0)]);
        assert_eq!(plan_targets(&weights, 0).total(), 0);
    }
}
