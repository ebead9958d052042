use rand::distributions::Alphanumeric;
use rand::Rng;

/// Generates a random alphanumeric token of the given length.
///
/// Used for verification tokens (subscription and user-callback
/// round-trips) and outbound shared secrets.
pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generates a WebSub verification challenge.
///
/// Challenges are round-tripped through the subscriber's callback in a
/// query parameter, so they stay URL-safe alphanumeric.
pub fn random_challenge() -> String {
    random_token(32)
}
