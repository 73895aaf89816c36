// Copyright (C) 2025 The Wizard Pipeline Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Catalog module - typed access to the repository and project databases.

pub mod memory;
pub mod proxy;
mod traits;

pub use memory::MemoryCatalog;
pub use proxy::ProxyCatalog;
pub use traits::*;

/// Seconds since the epoch, as stored in `creation_time` columns.
pub fn now_timestamp() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Next zero-padded version name after `last` (`0001` when there is none).
pub fn next_version_name(last: Option<&str>) -> String {
    let next = last
        .and_then(|name| name.trim().parse::<u32>().ok())
        .map_or(1, |n| n + 1);
    format!("{next:04}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_version_name() {
        assert_eq!(next_version_name(None), "0001");
        assert_eq!(next_version_name(Some("0001")), "0002");
        assert_eq!(next_version_name(Some("0099")), "0100");
        assert_eq!(next_version_name(Some("9999")), "10000");
        assert_eq!(next_version_name(Some("garbage")), "0001");
    }
}
