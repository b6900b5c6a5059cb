// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Well-known service paths served by every host.

/// Query task factory. A POST here runs a query (broadcast when requested).
pub const QUERY_TASKS: &str = "/core/query-tasks";

/// Node-local query task factory; never fans out.
pub const LOCAL_QUERY_TASKS: &str = "/core/local-query-tasks";

/// Prefix of result pages handed out as `nextPageLink`.
pub const QUERY_PAGE: &str = "/core/query-page";

/// Join a factory link and a document id into a self-link.
pub fn child_link(factory_link: &str, id: &str) -> String {
    let id = id.trim_start_matches('/');
    format!("{}/{}", factory_link.trim_end_matches('/'), id)
}

/// Last path segment of a link.
pub fn last_segment(link: &str) -> &str {
    link.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(link)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_link() {
        assert_eq!(child_link("/cloudstore/hosts", "h1"), "/cloudstore/hosts/h1");
        assert_eq!(child_link("/cloudstore/hosts/", "/h1"), "/cloudstore/hosts/h1");
    }

    #[test]
    fn test_last_segment() {
        assert_eq!(last_segment("/cloudstore/hosts/h1"), "h1");
        assert_eq!(last_segment("h1"), "h1");
    }
}
