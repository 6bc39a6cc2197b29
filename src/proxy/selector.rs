use std::collections::BTreeMap;

use rand::Rng;

use crate::database::channel::{Channel, RoutableChannel};
use crate::error::GatewayError;
use crate::service::app_state::AppState;

/// Active channels able to serve `model`, in the order they should be tried.
pub async fn select_candidates(app_state: &AppState, model: &str) -> Result<Vec<RoutableChannel>, GatewayError> {
    let model_name = model.to_string();
    let channels = app_state
        .db
        .run(move |conn| Channel::list_active_for_model(conn, &model_name))
        .await?;
    let ordered = order_candidates(channels, &mut rand::rng());
    if ordered.is_empty() {
        return Err(GatewayError::NoAvailableChannel(model.to_string()));
    }
    Ok(ordered)
}

/// Lower priority tiers come first. Inside a tier, channels are drawn by
/// weight without replacement, so a channel with weight `w` out of a tier
/// total `W` is tried next with probability `w / W`.
pub fn order_candidates<R: Rng + ?Sized>(channels: Vec<RoutableChannel>, rng: &mut R) -> Vec<RoutableChannel> {
    let mut tiers: BTreeMap<i32, Vec<RoutableChannel>> = BTreeMap::new();
    for candidate in channels.into_iter().filter(|c| c.channel.is_active) {
        tiers.entry(candidate.channel.priority).or_default().push(candidate);
    }

    let mut ordered = Vec::new();
    for (_, mut tier) in tiers {
        while !tier.is_empty() {
            let total: u64 = tier.iter().map(weight_of).sum();
            let mut ticket = rng.random_range(0..total);
            let mut picked = tier.len() - 1;
            for (index, candidate) in tier.iter().enumerate() {
                let weight = weight_of(candidate);
                if ticket < weight {
                    picked = index;
                    break;
                }
                ticket -= weight;
            }
            ordered.push(tier.swap_remove(picked));
        }
    }
    ordered
}

// Zero or negative weights still get a minimal share.
fn weight_of(candidate: &RoutableChannel) -> u64 {
    candidate.channel.weight.max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn candidate(id: i64, priority: i32, weight: i32) -> RoutableChannel {
        RoutableChannel {
            channel: Channel {
                id,
                priority,
                weight,
                is_active: true,
                ..Default::default()
            },
            upstream_model: "gpt-4o-mini".to_string(),
        }
    }

    fn ids(ordered: &[RoutableChannel]) -> Vec<i64> {
        ordered.iter().map(|c| c.channel.id).collect()
    }

    #[test]
    fn test_priority_is_a_hard_boundary() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let ordered = order_candidates(
                vec![candidate(3, 1, 100), candidate(1, 0, 1), candidate(4, 2, 5), candidate(2, 0, 1)],
                &mut rng,
            );
            let order = ids(&ordered);
            assert_eq!(order.len(), 4);
            assert!(order[..2].contains(&1) && order[..2].contains(&2));
            assert_eq!(&order[2..], &[3, 4]);
        }
    }

    #[test]
    fn test_inactive_channels_are_skipped() {
        let mut inactive = candidate(9, 0, 10);
        inactive.channel.is_active = false;
        let ordered = order_candidates(vec![inactive, candidate(1, 0, 1)], &mut StdRng::seed_from_u64(1));
        assert_eq!(ids(&ordered), vec![1]);
    }

    #[test]
    fn test_weighted_first_pick_matches_ratio() {
        let mut rng = StdRng::seed_from_u64(42);
        let trials = 10_000;
        let mut first_heavy = 0u32;
        for _ in 0..trials {
            let ordered = order_candidates(vec![candidate(1, 0, 3), candidate(2, 0, 1)], &mut rng);
            assert_eq!(ordered.len(), 2);
            if ordered[0].channel.id == 1 {
                first_heavy += 1;
            }
        }

        let observed = [first_heavy as f64, (trials - first_heavy) as f64];
        let expected = [trials as f64 * 0.75, trials as f64 * 0.25];
        let chi_square: f64 = observed
            .iter()
            .zip(expected.iter())
            .map(|(o, e)| (o - e).powi(2) / e)
            .sum();
        // df = 1, p = 0.001
        assert!(chi_square < 10.83, "chi-square {} too large ({} / {})", chi_square, first_heavy, trials);
    }

    #[test]
    fn test_zero_weight_still_selected() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut seen_first = false;
        for _ in 0..500 {
            let ordered = order_candidates(vec![candidate(1, 0, 0), candidate(2, 0, 0)], &mut rng);
            assert_eq!(ordered.len(), 2);
            seen_first |= ordered[0].channel.id == 1;
        }
        assert!(seen_first);
    }
}
