//! GraphQL documents sent to the remote API.
//!
//! All three project documents share one node selection so that a full-sync
//! page, a catch-up page and a webhook payload decode identically.

use std::sync::LazyLock;

pub const PAGE_SIZE: u32 = 10_000;

const PROJECT_NODE_SELECTION: &str = "\
dbId
code
description
createdAt
modifiedAt
text
email
yourReference
extIdentifier
external
billable
fixedClient
allowPosting
timesheetEntry
accessControl
assignment
activity
extOrder
contract
progressDate
pctCompleted
overview
fromDate
toDate
invoiceHeader
invoiceFooter
shortInfo
shortInternalInfo
totalRevenue
yearlyRevenue
contractedRevenue
totalCost
yearlyCost
totalEstimateHours
yearlyEstimateHours
budgetCoveragePercent
expenseLedger
fundProject
mainProject {
  dbId
}
xgl {
  dbId
  code
}
glObject1 {
  dbId
  code
}
glObject2 {
  dbId
  code
}
glObject3 {
  dbId
  code
}
glObject4 {
  dbId
  code
}
glObject5 {
  dbId
  code
}";

/// Initial backfill: every project, ascending by dbId, one cursor page at a
/// time.
pub static PROJECTS_FULL_SYNC_QUERY: LazyLock<String> = LazyLock::new(|| {
    format!(
        "query ($after: String) {{
  projects(first: {PAGE_SIZE}, after: $after) {{
    pageInfo {{
      hasNextPage
    }}
    edges {{
      cursor
      node {{
{PROJECT_NODE_SELECTION}
      }}
    }}
  }}
}}"
    )
});

/// Catch-up pass: only projects modified at or after the given local
/// timestamp.
pub static PROJECTS_CHANGES_QUERY: LazyLock<String> = LazyLock::new(|| {
    format!(
        "query ($since: LocalDateTime!, $after: String) {{
  projects(first: {PAGE_SIZE}, after: $after, filter: {{ modifiedAt_gte: $since }}) {{
    pageInfo {{
      hasNextPage
    }}
    edges {{
      cursor
      node {{
{PROJECT_NODE_SELECTION}
      }}
    }}
  }}
}}"
    )
});

/// Serialized subscription payload registered with the remote side. The
/// remote stores it as an opaque string, so it is collapsed to one line and
/// wrapped in the JSON envelope it expects.
pub static PROJECTS_SUBSCRIPTION_PAYLOAD: LazyLock<String> = LazyLock::new(|| {
    let document = format!(
        "subscription {{
  projects {{
    edges {{
      syncVersion
      cursor
      node {{
{PROJECT_NODE_SELECTION}
      }}
    }}
  }}
}}"
    );
    let one_line: String = document
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    format!("{{ \"query\": \"{one_line}\" }}")
});

pub const REGISTER_WEBHOOK_MUTATION: &str = "\
mutation ($description: String!, $url: String!, $serializedPayload: String!) {
  addWebhooks(inputs: [{ description: $description, url: $url, serializedPayload: $serializedPayload }]) {
    edges {
      node {
        dbId
      }
    }
  }
}";

pub const REMOVE_WEBHOOK_MUTATION: &str = "\
mutation ($dbId: Int!) {
  removeWebhooks(dbIds: [$dbId]) {
    numAffected
  }
}";

pub const WEBHOOK_STATE_QUERY: &str = "\
query ($dbId: Int!) {
  webhook(dbId: $dbId) {
    state {
      code
    }
  }
}";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_sync_query_pages_by_cursor() {
        let q = PROJECTS_FULL_SYNC_QUERY.as_str();
        assert!(q.contains("first: 10000"));
        assert!(q.contains("after: $after"));
        assert!(q.contains("hasNextPage"));
        assert!(q.contains("mainProject {"));
    }

    #[test]
    fn changes_query_filters_by_modification_time() {
        let q = PROJECTS_CHANGES_QUERY.as_str();
        assert!(q.contains("modifiedAt_gte: $since"));
        assert!(q.contains("after: $after"));
    }

    #[test]
    fn subscription_payload_is_single_line_json() {
        let payload = PROJECTS_SUBSCRIPTION_PAYLOAD.as_str();
        assert!(!payload.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(payload).expect("valid json");
        let query = parsed["query"].as_str().expect("query string");
        assert!(query.starts_with("subscription {"));
        assert!(query.contains("syncVersion"));
    }
}
