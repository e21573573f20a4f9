use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A challenge shown on a form. `id` travels in a hidden field and comes back with the answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub id: String,
    pub question: String,
}

pub trait Captcha: Send + Sync {
    fn challenge(&self) -> Challenge;

    /// True if `solution` answers the challenge `id` and the challenge is still within its window.
    fn verify(&self, id: &str, solution: &str) -> bool;
}

/// Stateless arithmetic captcha. The id encodes issue time and nonce, authenticated together
/// with the expected answer, so no server-side storage is needed.
pub struct ArithmeticCaptcha {
    secret: Vec<u8>,
    window: Duration,
}

impl ArithmeticCaptcha {
    pub fn new(secret: &[u8], window: Duration) -> Self {
        Self {
            secret: secret.to_vec(),
            window,
        }
    }

    pub fn with_random_secret(window: Duration) -> Self {
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        Self::new(&secret, window)
    }

    fn signature(&self, issued: i64, nonce: &str, answer: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size");
        mac.update(format!("{issued}.{nonce}.{answer}").as_bytes());
        mac
    }

    pub fn challenge_at(&self, now: DateTime<Utc>) -> Challenge {
        let mut rng = rand::rng();
        let a: u32 = rng.random_range(1..=20);
        let b: u32 = rng.random_range(1..=20);
        let mut nonce = [0u8; 8];
        rng.fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let issued = now.timestamp();
        let mac = self.signature(issued, &nonce, &(a + b).to_string());

        Challenge {
            id: format!(
                "{issued}.{nonce}.{}",
                hex::encode(mac.finalize().into_bytes())
            ),
            question: format!("{a} + {b}"),
        }
    }

    pub fn verify_at(&self, id: &str, solution: &str, now: DateTime<Utc>) -> bool {
        let mut parts = id.splitn(3, '.');
        let (Some(issued), Some(nonce), Some(tag)) = (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        let Ok(issued) = issued.parse::<i64>() else {
            return false;
        };
        let Ok(tag) = hex::decode(tag) else {
            return false;
        };
        let age = now.timestamp() - issued;
        if age < 0 || age > self.window.num_seconds() {
            return false;
        }
        self.signature(issued, nonce, solution.trim())
            .verify_slice(&tag)
            .is_ok()
    }
}

impl Captcha for ArithmeticCaptcha {
    fn challenge(&self) -> Challenge {
        self.challenge_at(Utc::now())
    }

    fn verify(&self, id: &str, solution: &str) -> bool {
        self.verify_at(id, solution, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solve(question: &str) -> String {
        let (a, b) = question.split_once(" + ").unwrap();
        (a.parse::<u32>().unwrap() + b.parse::<u32>().unwrap()).to_string()
    }

    #[test]
    fn test_correct_answer_within_window() {
        let captcha = ArithmeticCaptcha::new(b"k", Duration::hours(1));
        let now = Utc::now();
        let challenge = captcha.challenge_at(now);
        let answer = solve(&challenge.question);

        assert!(captcha.verify_at(&challenge.id, &answer, now));
        assert!(captcha.verify_at(&challenge.id, &format!(" {answer} "), now + Duration::minutes(59)));
    }

    #[test]
    fn test_wrong_answer_or_expired() {
        let captcha = ArithmeticCaptcha::new(b"k", Duration::hours(1));
        let now = Utc::now();
        let challenge = captcha.challenge_at(now);
        let answer = solve(&challenge.question);

        assert!(!captcha.verify_at(&challenge.id, "1000", now));
        assert!(!captcha.verify_at(&challenge.id, &answer, now + Duration::minutes(61)));
        assert!(!captcha.verify_at(&challenge.id, &answer, now - Duration::minutes(1)));
    }

    #[test]
    fn test_forged_ids_fail() {
        let captcha = ArithmeticCaptcha::new(b"k", Duration::hours(1));
        let other = ArithmeticCaptcha::new(b"other", Duration::hours(1));
        let now = Utc::now();
        let challenge = other.challenge_at(now);
        let answer = solve(&challenge.question);

        assert!(!captcha.verify_at(&challenge.id, &answer, now));
        assert!(!captcha.verify_at("", &answer, now));
        assert!(!captcha.verify_at("1.2", &answer, now));
        assert!(!captcha.verify_at("x.y.zz", &answer, now));
    }
}
