// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Severity-filtered logging over the mailbox.
//!
//! There is no allocator and no console; log output is formatted into a
//! fixed stack buffer and shipped to the host as a `Text` message,
//! truncated if it doesn't fit. A failure to send is swallowed -- logging
//! must never take the firmware down, and the fault path doesn't come near
//! this module at all.

use core::fmt::{self, Write};

use npu_abi::LogSeverity;
use npu_mailbox::{hal::Hal, Mailbox};

/// Longest log line that survives untruncated, matching the scratch buffer
/// the original firmware formatted into.
pub const MAX_LINE: usize = 128;

pub struct Logger {
    threshold: LogSeverity,
}

impl Logger {
    pub fn new(threshold: LogSeverity) -> Self {
        Self { threshold }
    }

    pub fn enabled(&self, severity: LogSeverity) -> bool {
        severity as u32 <= self.threshold as u32
    }

    /// Formats and sends one log line.
    pub fn log<H: Hal>(
        &self,
        hal: &mut H,
        mailbox: &mut Mailbox,
        severity: LogSeverity,
        args: fmt::Arguments<'_>,
    ) {
        if !self.enabled(severity) {
            return;
        }
        let mut line = LineBuf::new();
        write!(line, "{args}").ok();
        mailbox.send_text(hal, severity, line.as_bytes()).ok();
    }
}

/// Fixed-capacity formatting sink; overflow truncates. Public because the
/// worker formats its own lines into one of these before shipping them
/// through the log service.
pub struct LineBuf {
    buf: [u8; MAX_LINE],
    len: usize,
}

impl LineBuf {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_LINE],
            len: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl Default for LineBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let s = s.as_bytes();
        let n = s.len().min(self.buf.len() - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s[..n]);
        self.len += n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::mailbox;
    use npu_mailbox::model::ModelHal;

    #[test]
    fn threshold_filters() {
        let mut hal = ModelHal::new();
        let mut mb = mailbox(512);
        let logger = Logger::new(LogSeverity::Warning);

        logger.log(&mut hal, &mut mb, LogSeverity::Debug, format_args!("x"));
        assert_eq!(hal.host_irqs, 0);

        logger.log(&mut hal, &mut mb, LogSeverity::Error, format_args!("y"));
        assert_eq!(hal.host_irqs, 1);
    }

    #[test]
    fn long_lines_truncate() {
        let mut line = LineBuf::new();
        for _ in 0..40 {
            write!(line, "0123456789").unwrap();
        }
        assert_eq!(line.as_bytes().len(), MAX_LINE);
        assert!(line.as_bytes().iter().all(|&b| b.is_ascii_digit()));
    }
}
