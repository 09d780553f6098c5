//! Which request paths map onto which local collections.

use serde::Deserialize;
use url::Url;

/// A list endpoint whose responses mirror one collection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CacheRoute {
  /// Request path, e.g. "/api/clients"
  pub path: String,
  pub collection: String,
}

/// A request URL resolved against the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteMatch<'a> {
  pub collection: &'a str,
  /// The request carried a query string, so its response may be a subset
  pub filtered: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RouteTable {
  routes: Vec<CacheRoute>,
}

fn normalize(path: &str) -> &str {
  match path.trim_end_matches('/') {
    "" => "/",
    trimmed => trimmed,
  }
}

impl RouteTable {
  pub fn new(routes: Vec<CacheRoute>) -> Self {
    Self { routes }
  }

  pub fn is_empty(&self) -> bool {
    self.routes.is_empty()
  }

  /// Match `url` (absolute, or a path) on its exact path.
  pub fn resolve(&self, url: &str) -> Option<RouteMatch<'_>> {
    let parsed = Url::parse(url)
      .or_else(|_| Url::parse("http://localhost/").and_then(|base| base.join(url)))
      .ok()?;
    let path = normalize(parsed.path());

    self
      .routes
      .iter()
      .find(|route| normalize(&route.path) == path)
      .map(|route| RouteMatch {
        collection: &route.collection,
        filtered: parsed.query().is_some_and(|q| !q.is_empty()),
      })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn table() -> RouteTable {
    RouteTable::new(vec![
      CacheRoute {
        path: "/api/clients".into(),
        collection: "clients".into(),
      },
      CacheRoute {
        path: "/api/calls/".into(),
        collection: "calls".into(),
      },
    ])
  }

  #[test]
  fn test_exact_paths_match() {
    let table = table();
    assert_eq!(table.resolve("/api/clients").unwrap().collection, "clients");
    assert_eq!(table.resolve("/api/clients/").unwrap().collection, "clients");
    assert_eq!(table.resolve("/api/calls").unwrap().collection, "calls");
    assert_eq!(
      table
        .resolve("https://crm.example.com/api/calls")
        .unwrap()
        .collection,
      "calls"
    );
  }

  #[test]
  fn test_item_paths_do_not_match_collections() {
    let table = table();
    assert!(table.resolve("/api/clients/42").is_none());
    assert!(table.resolve("/api").is_none());
  }

  #[test]
  fn test_query_marks_match_filtered() {
    let table = table();
    assert!(!table.resolve("/api/clients").unwrap().filtered);
    assert!(table.resolve("/api/clients?page=2").unwrap().filtered);
  }
}
