use crate::{frame::HEADER_LEN, Params};

const MIN_FRAME_SIZE: u32 = 128;
const MAX_FRAME_SIZE: u32 = 10240;

/// Tunable protocol parameters, shared by reference across a Session
/// Manager's endpoint rather than kept as process-global mutable state.
///
/// `mtu` is always derived from `max_frame_size` and can never be set
/// directly — see [`Options::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options {
    pub max_frame_size: u32,
    pub mtu: u32,
    pub no_ack_count: u32,
    pub storage_max: u32,
    pub storage_trim: u32,
    pub op_timeout: u32,
    pub max_retries: u32,
    pub max_connections: u32,
    pub max_requests_in_queue: u32,
}

impl Default for Options {
    fn default() -> Self {
        let max_frame_size = 4096;
        Self {
            max_frame_size,
            mtu: max_frame_size - HEADER_LEN as u32,
            no_ack_count: 5,
            storage_max: 100,
            storage_trim: 50,
            op_timeout: 500,
            max_retries: 20,
            max_connections: 1024,
            max_requests_in_queue: 21,
        }
    }
}

impl Options {
    /// Loads options from a string-keyed parameter map, falling back to
    /// defaults for missing or unparsable values. `mtu` is never read from
    /// `params` even if present; it is always recomputed from
    /// `max_frame_size`.
    ///
    /// ```
    /// use frame::{Options, Params};
    ///
    /// let mut params = Params::new();
    /// params.insert("max_frame_size".into(), "2096".into());
    /// params.insert("mtu".into(), "666".into());
    ///
    /// let opts = Options::load(&params);
    /// assert_eq!(opts.max_frame_size, 2096);
    /// assert_eq!(opts.mtu, 2096 - 36);
    /// ```
    pub fn load(params: &Params) -> Self {
        let defaults = Self::default();

        let max_frame_size = parse_or(params, "max_frame_size", defaults.max_frame_size)
            .clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE);

        Self {
            max_frame_size,
            mtu: max_frame_size - HEADER_LEN as u32,
            no_ack_count: parse_or(params, "no_ack_count", defaults.no_ack_count),
            storage_max: parse_or(params, "storage_max", defaults.storage_max),
            storage_trim: parse_or(params, "storage_trim", defaults.storage_trim),
            op_timeout: parse_or(params, "op_timeout", defaults.op_timeout),
            max_retries: parse_or(params, "max_retries", defaults.max_retries),
            max_connections: parse_or(params, "max_connections", defaults.max_connections),
            max_requests_in_queue: parse_or(
                params,
                "max_requests_in_queue",
                defaults.max_requests_in_queue,
            ),
        }
    }
}

fn parse_or(params: &Params, key: &str, default: u32) -> u32 {
    params
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let opts = Options::default();
        assert_eq!(opts.max_frame_size, 4096);
        assert_eq!(opts.mtu, 4096 - 36);
        assert_eq!(opts.no_ack_count, 5);
        assert_eq!(opts.storage_max, 100);
        assert_eq!(opts.storage_trim, 50);
        assert_eq!(opts.op_timeout, 500);
        assert_eq!(opts.max_retries, 20);
        assert_eq!(opts.max_connections, 1024);
        assert_eq!(opts.max_requests_in_queue, 21);
    }

    #[test]
    fn loading_is_idempotent() {
        let mut params = Params::new();
        params.insert("max_frame_size".into(), "2096".into());
        params.insert("no_ack_count".into(), "4".into());
        params.insert("storage_max".into(), "89".into());
        params.insert("storage_trim".into(), "30".into());
        params.insert("op_timeout".into(), "200".into());
        params.insert("max_retries".into(), "10".into());

        let once = Options::load(&params);
        let twice = Options::load(&params);
        assert_eq!(once, twice);
        assert_eq!(once.mtu, 2096 - 36);
    }

    #[test]
    fn mtu_cannot_be_set_directly() {
        let mut params = Params::new();
        params.insert("mtu".into(), "666".into());
        let opts = Options::load(&params);
        assert_eq!(opts.mtu, Options::default().mtu);
    }

    #[test]
    fn max_frame_size_is_clamped() {
        let mut params = Params::new();
        params.insert("max_frame_size".into(), "1".into());
        assert_eq!(Options::load(&params).max_frame_size, MIN_FRAME_SIZE);

        params.insert("max_frame_size".into(), "999999".into());
        assert_eq!(Options::load(&params).max_frame_size, MAX_FRAME_SIZE);
    }
}
