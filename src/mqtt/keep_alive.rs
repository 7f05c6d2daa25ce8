use std::cmp;
use std::fmt::{self, Display, Formatter};
use std::num::NonZeroU16;
use std::time::Duration;

/// An MQTT Keep Alive interval, in seconds. Zero disables it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct KeepAlive(Option<NonZeroU16>);

impl KeepAlive {
    pub fn from_seconds(seconds: u16) -> KeepAlive {
        Self(NonZeroU16::new(seconds))
    }

    pub fn from_duration(duration: Duration) -> KeepAlive {
        Self::from_seconds(duration.as_secs().try_into().unwrap_or(u16::MAX))
    }

    pub fn is_zero(self) -> bool {
        self.0.is_none()
    }

    pub fn as_seconds(self) -> u16 {
        self.0.map_or(0, |seconds| seconds.get())
    }

    /// The server side read timeout: 1.5 times the interval.
    ///
    /// > If the Keep Alive value is non-zero and the Server does not receive an MQTT Control Packet
    /// > from the Client within one and a half times the Keep Alive time period, it MUST close the
    /// > Network Connection to the Client as if the network had failed [MQTT-3.1.2-22].
    pub fn as_timeout(self) -> Option<Duration> {
        self.0
            .map(|seconds| Duration::from_millis(u64::from(seconds.get()) * 1500))
    }

    /// How long the client may stay idle before it sends a `PINGREQ`.
    ///
    /// One second short of the interval, so the server sees traffic well inside its grace period.
    pub fn ping_after(self) -> Option<Duration> {
        self.0
            .map(|seconds| Duration::from_secs(u64::from(seconds.get() - 1)))
    }

    /// Apply the server's maximum Keep Alive to the interval a client asked for.
    ///
    /// A client asking for none, or for more than `max`, gets `max`. A zero `max` allows anything.
    pub fn with_max(self, max: Self) -> Self {
        Self(match (self.0, max.0) {
            (Some(keep_alive), Some(max_keep_alive)) => Some(cmp::min(keep_alive, max_keep_alive)),
            (None, max_keep_alive) => max_keep_alive,
            (keep_alive, None) => keep_alive,
        })
    }
}

impl Display for KeepAlive {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.as_seconds())
    }
}
