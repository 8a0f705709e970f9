//! CAPTCHA escalation gate.
//!
//! Consulted only after a rate-limit denial. When the identity's
//! suspicion score crosses the configured threshold, the denial body
//! advertises a human-verification challenge as an alternative to
//! waiting out the retry interval.

use serde::Serialize;

use crate::models::CaptchaConfig;

#[derive(Debug, Clone, Serialize)]
pub struct CaptchaChallenge {
    pub requires_captcha: bool,
    pub captcha_type: String,
}

pub struct CaptchaGate {
    config: CaptchaConfig,
}

impl CaptchaGate {
    pub fn new(config: CaptchaConfig) -> Self {
        Self { config }
    }

    /// Returns a challenge when the suspicion score warrants one.
    pub fn evaluate(&self, suspicion_score: f64) -> Option<CaptchaChallenge> {
        if suspicion_score >= self.config.suspicion_threshold {
            Some(CaptchaChallenge {
                requires_captcha: true,
                captcha_type: self.config.captcha_type.clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_challenge_issued_above_threshold() {
        let gate = CaptchaGate::new(CaptchaConfig::default());
        let challenge = gate.evaluate(0.9).expect("challenge expected");
        assert!(challenge.requires_captcha);
        assert_eq!(challenge.captcha_type, "recaptcha_v2");
    }

    #[test]
    fn test_no_challenge_below_threshold() {
        let gate = CaptchaGate::new(CaptchaConfig::default());
        assert!(gate.evaluate(0.2).is_none());
    }

    #[test]
    fn test_threshold_boundary_is_inclusive() {
        let gate = CaptchaGate::new(CaptchaConfig {
            suspicion_threshold: 0.6,
            captcha_type: "recaptcha_v2".to_string(),
        });
        assert!(gate.evaluate(0.6).is_some());
    }
}
