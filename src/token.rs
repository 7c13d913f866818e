//! Tokens handed out in `get_peers` responses and required back in `announce_peer`.
//!
//! We don't store the tokens we issue. A token is the CRC32C of a secret and the requester's
//! ip. The secret changes every 10 minutes and tokens made with the current or the previous
//! secret are accepted, so a token stays valid for 10 to 20 minutes.

use std::{
    convert::TryInto,
    net::IpAddr,
    time::Duration,
};
use tokio::time::Instant;

const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub const TOKEN_LEN: usize = 4;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Token([u8; TOKEN_LEN]);

impl Token {
    pub fn new(bytes: &[u8]) -> Option<Self> {
        Some(Self(bytes.try_into().ok()?))
    }
}

impl AsRef<[u8]> for Token {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

pub(crate) struct TokenStore {
    curr_secret: u32,
    last_secret: u32,
    last_refresh: Instant,
}

impl TokenStore {
    pub fn new() -> TokenStore {
        // A random previous secret rather than a placeholder, so a freshly started node doesn't
        // accept tokens nobody was issued.
        TokenStore {
            curr_secret: rand::random(),
            last_secret: rand::random(),
            last_refresh: Instant::now(),
        }
    }

    pub fn checkout(&mut self, addr: IpAddr) -> Token {
        self.refresh_check();

        generate_token(addr, self.curr_secret)
    }

    pub fn checkin(&mut self, addr: IpAddr, token: &[u8]) -> bool {
        self.refresh_check();

        match Token::new(token) {
            Some(token) => {
                token == generate_token(addr, self.curr_secret)
                    || token == generate_token(addr, self.last_secret)
            }
            None => false,
        }
    }

    fn refresh_check(&mut self) {
        let intervals = self.last_refresh.elapsed().as_secs() / REFRESH_INTERVAL.as_secs();

        match intervals {
            0 => (),
            1 => {
                self.last_secret = self.curr_secret;
                self.curr_secret = rand::random();
                self.last_refresh = Instant::now();
            }
            // Both secrets are too old.
            _ => {
                self.last_secret = rand::random();
                self.curr_secret = rand::random();
                self.last_refresh = Instant::now();
            }
        }
    }
}

fn generate_token(addr: IpAddr, secret: u32) -> Token {
    let crc = crc32c::crc32c_append(0, &secret.to_be_bytes());
    let crc = match addr {
        IpAddr::V4(v4) => crc32c::crc32c_append(crc, &v4.octets()),
        IpAddr::V6(v6) => crc32c::crc32c_append(crc, &v6.octets()),
    };

    Token(crc.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[tokio::test]
    async fn positive_accept_valid_v4_token() {
        let mut store = TokenStore::new();
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        let token = store.checkout(ip);

        assert!(store.checkin(ip, token.as_ref()));
    }

    #[tokio::test]
    async fn positive_accept_valid_v6_token() {
        let mut store = TokenStore::new();
        let ip = IpAddr::V6(Ipv6Addr::LOCALHOST);

        let token = store.checkout(ip);

        assert!(store.checkin(ip, token.as_ref()));
    }

    #[tokio::test]
    async fn negative_reject_token_for_other_ip() {
        let mut store = TokenStore::new();
        let token = store.checkout(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));

        assert!(!store.checkin(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)), token.as_ref()));
    }

    #[tokio::test]
    async fn negative_reject_malformed_token() {
        let mut store = TokenStore::new();
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        assert!(!store.checkin(ip, b"aa"));
        assert!(!store.checkin(ip, b""));
    }

    #[tokio::test(start_paused = true)]
    async fn positive_accept_previous_secret() {
        let mut store = TokenStore::new();
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let token = store.checkout(ip);

        tokio::time::advance(REFRESH_INTERVAL).await;

        assert!(store.checkin(ip, token.as_ref()));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_reject_expired_token() {
        let mut store = TokenStore::new();
        let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let token = store.checkout(ip);

        tokio::time::advance(REFRESH_INTERVAL * 2).await;

        assert!(!store.checkin(ip, token.as_ref()));
    }
}
