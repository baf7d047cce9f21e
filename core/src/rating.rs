//! Two-team Bayesian skill updates.
//!
//! Each player carries a Gaussian belief over latent skill. After a round,
//! the winning team's beliefs move up and the losing team's move down, in
//! proportion to how surprising the outcome was under the current beliefs:
//! an upset shifts ratings far more than a confident favorite winning.
//!
//! The update is the closed-form two-team win/loss message pass of the
//! classic TrueSkill model, with a fixed performance noise `beta` and a
//! dynamics term `tau` added to every participant's variance before each
//! round. It is pure `f64` arithmetic with no hidden state: replaying the
//! same rounds from the same beliefs reproduces bit-identical results.

use crate::model::{BETA, SKILL_MEAN, SKILL_STDEV, TAU};
use serde::{Deserialize, Serialize};

/// Gaussian belief over a player's latent skill.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Rating {
    pub mu: f64,
    pub sigma: f64,
}

impl Default for Rating {
    fn default() -> Self {
        Self {
            mu: SKILL_MEAN,
            sigma: SKILL_STDEV,
        }
    }
}

impl Rating {
    pub fn new(mu: f64, sigma: f64) -> Self {
        Self { mu, sigma }
    }
}

/// Parameter environment for rating updates.
///
/// Draws are not modeled; every round has a winner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RatingModel {
    /// Prior mean for unseen players.
    pub mu: f64,
    /// Prior standard deviation for unseen players.
    pub sigma: f64,
    /// Performance noise per player per round.
    pub beta: f64,
    /// Skill drift added to every participant's variance each round.
    pub tau: f64,
}

impl Default for RatingModel {
    fn default() -> Self {
        Self {
            mu: SKILL_MEAN,
            sigma: SKILL_STDEV,
            beta: BETA,
            tau: TAU,
        }
    }
}

impl RatingModel {
    /// Update beliefs after a round in which `winners` beat `losers`.
    ///
    /// Ratings are returned in input order. The winning team's means
    /// strictly increase and the losing team's strictly decrease; each
    /// player's variance never grows by more than the dynamics term.
    pub fn rate(&self, winners: &[Rating], losers: &[Rating]) -> (Vec<Rating>, Vec<Rating>) {
        let winners: Vec<Rating> = winners.iter().map(|r| self.drift(r)).collect();
        let losers: Vec<Rating> = losers.iter().map(|r| self.drift(r)).collect();

        let winner_mu: f64 = winners.iter().map(|r| r.mu).sum();
        let loser_mu: f64 = losers.iter().map(|r| r.mu).sum();
        let sigma_sq: f64 = winners
            .iter()
            .chain(&losers)
            .map(|r| r.sigma * r.sigma)
            .sum();
        let size = (winners.len() + losers.len()) as f64;
        let c_sq = sigma_sq + size * self.beta * self.beta;
        let c = c_sq.sqrt();

        let t = (winner_mu - loser_mu) / c;
        let v = v_win(t);
        let w = w_win(t, v);

        let update = |team: &[Rating], sign: f64| {
            team.iter()
                .map(|r| {
                    let var = r.sigma * r.sigma;
                    Rating {
                        mu: r.mu + sign * var / c * v,
                        sigma: (var * (1.0 - var / c_sq * w)).sqrt(),
                    }
                })
                .collect()
        };
        (update(&winners, 1.0), update(&losers, -1.0))
    }

    fn drift(&self, rating: &Rating) -> Rating {
        Rating {
            mu: rating.mu,
            sigma: (rating.sigma * rating.sigma + self.tau * self.tau).sqrt(),
        }
    }

    /// Probability that `team_a` beats `team_b` under current beliefs.
    pub fn win_probability(&self, team_a: &[Rating], team_b: &[Rating]) -> f64 {
        let delta_mu: f64 =
            team_a.iter().map(|r| r.mu).sum::<f64>() - team_b.iter().map(|r| r.mu).sum::<f64>();
        let sigma_sq: f64 = team_a
            .iter()
            .chain(team_b)
            .map(|r| r.sigma * r.sigma)
            .sum();
        let size = (team_a.len() + team_b.len()) as f64;
        cdf(delta_mu / (size * self.beta * self.beta + sigma_sq).sqrt())
    }

    /// How balanced a matchup is, in `(0, 1]`: the relative likelihood of
    /// the two teams performing identically. Symmetric in its arguments.
    pub fn match_quality(&self, team_a: &[Rating], team_b: &[Rating]) -> f64 {
        let delta_mu: f64 =
            team_a.iter().map(|r| r.mu).sum::<f64>() - team_b.iter().map(|r| r.mu).sum::<f64>();
        let sigma_sq: f64 = team_a
            .iter()
            .chain(team_b)
            .map(|r| r.sigma * r.sigma)
            .sum();
        let size = (team_a.len() + team_b.len()) as f64;
        let beta_sq = size * self.beta * self.beta;
        let denom = beta_sq + sigma_sq;
        (beta_sq / denom).sqrt() * (-delta_mu * delta_mu / (2.0 * denom)).exp()
    }
}

/// Running geometric-mean quality over a series of matchups.
#[derive(Clone, Debug)]
pub struct QualityAccumulator {
    model: RatingModel,
    log_quality: f64,
    matches: u32,
}

impl QualityAccumulator {
    pub fn new(model: RatingModel) -> Self {
        Self {
            model,
            log_quality: 0.0,
            matches: 0,
        }
    }

    /// Fold in one matchup and return the quality so far.
    pub fn update(&mut self, team_a: &[Rating], team_b: &[Rating]) -> f64 {
        self.log_quality += self.model.match_quality(team_a, team_b).ln();
        self.matches += 1;
        (self.log_quality / f64::from(self.matches)).exp()
    }
}

/// Mean shift of a unit Gaussian truncated below at `-t`.
fn v_win(t: f64) -> f64 {
    let denom = cdf(t);
    if denom > f64::MIN_POSITIVE {
        pdf(t) / denom
    } else {
        // Far in the tail the ratio approaches the asymptote -t.
        -t
    }
}

/// Variance shrink factor for the same truncation; always in `(0, 1)`.
fn w_win(t: f64, v: f64) -> f64 {
    v * (v + t)
}

fn pdf(x: f64) -> f64 {
    (-(x * x) / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

fn cdf(x: f64) -> f64 {
    0.5 * erfc(-x / std::f64::consts::SQRT_2)
}

/// Complementary error function, Press et al. rational approximation
/// (fractional error below 1.2e-7 everywhere).
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + z / 2.0);
    let r = t
        * (-z * z - 1.26551223
            + t * (1.00002368
                + t * (0.37409196
                    + t * (0.09678418
                        + t * (-0.18628806
                            + t * (0.27886807
                                + t * (-1.13520398
                                    + t * (1.48851587
                                        + t * (-0.82215223 + t * 0.17087277)))))))))
        .exp();
    if x < 0.0 {
        2.0 - r
    } else {
        r
    }
}
