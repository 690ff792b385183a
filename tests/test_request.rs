use portcullis::http::request::{Method, Request, RequestBuilder};
use std::collections::HashMap;

#[test]
fn test_request_header_retrieval() {
    let mut headers = HashMap::new();
    headers.insert("Host".to_string(), "example.com".to_string());
    headers.insert("Content-Type".to_string(), "application/json".to_string());

    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
        body: vec![],
    };

    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.header("Content-Type"), Some("application/json"));
    assert_eq!(req.header("Missing"), None);
}

#[test]
fn test_request_content_length_parsing() {
    let mut headers = HashMap::new();
    headers.insert("Content-Length".to_string(), "42".to_string());

    let req = Request {
        method: Method::POST,
        path: "/api".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
        body: vec![],
    };

    assert_eq!(req.content_length(), 42);
}

#[test]
fn test_request_content_length_missing() {
    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert_eq!(req.content_length(), 0);
}

#[test]
fn test_request_keep_alive_http11_default() {
    // HTTP/1.1 defaults to keep-alive
    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_close() {
    let mut headers = HashMap::new();
    headers.insert("Connection".to_string(), "close".to_string());

    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
        body: vec![],
    };

    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_case_insensitive() {
    let mut headers = HashMap::new();
    headers.insert("Connection".to_string(), "Keep-Alive".to_string());

    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.1".to_string(),
        headers,
        body: vec![],
    };

    assert!(req.keep_alive());
}

#[test]
fn test_request_keep_alive_http10_default() {
    // HTTP/1.0 defaults to close
    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.0".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert!(!req.keep_alive());
}

#[test]
fn test_request_keep_alive_http10_opt_in() {
    let mut headers = HashMap::new();
    headers.insert("Connection".to_string(), "keep-alive".to_string());

    let req = Request {
        method: Method::GET,
        path: "/".to_string(),
        version: "HTTP/1.0".to_string(),
        headers,
        body: vec![],
    };

    assert!(req.keep_alive());
}

#[test]
fn test_request_method_from_string() {
    assert_eq!(Method::from_str("GET"), Some(Method::GET));
    assert_eq!(Method::from_str("POST"), Some(Method::POST));
    assert_eq!(Method::from_str("INVALID"), None);
    assert_eq!(Method::from_str("get"), None); // Case-sensitive
}

#[test]
fn test_request_route_path_strips_query() {
    let req = Request {
        method: Method::GET,
        path: "/search?q=rust&limit=5".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert_eq!(req.route_path(), "/search");
    assert_eq!(req.query(), Some("q=rust&limit=5"));
}

#[test]
fn test_request_route_path_without_query() {
    let req = Request {
        method: Method::GET,
        path: "/plain".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert_eq!(req.route_path(), "/plain");
    assert_eq!(req.query(), None);
}

#[test]
fn test_request_query_param_lookup() {
    let req = Request {
        method: Method::GET,
        path: "/greet?name=rust%20fan&lang=en".to_string(),
        version: "HTTP/1.1".to_string(),
        headers: HashMap::new(),
        body: vec![],
    };

    assert_eq!(req.param("name"), Some("rust fan".to_string()));
    assert_eq!(req.param("lang"), Some("en".to_string()));
    assert_eq!(req.param("missing"), None);
}

#[test]
fn test_request_builder_assembles_request() {
    let req = RequestBuilder::new()
        .method(Method::POST)
        .path("/api")
        .header("Host", "example.com")
        .body(b"payload".to_vec())
        .build()
        .unwrap();

    assert_eq!(req.method, Method::POST);
    assert_eq!(req.path, "/api");
    assert_eq!(req.header("Host"), Some("example.com"));
    assert_eq!(req.body, b"payload".to_vec());
}

#[test]
fn test_request_builder_requires_method_and_path() {
    assert!(RequestBuilder::new().path("/api").build().is_err());
    assert!(RequestBuilder::new().method(Method::GET).build().is_err());
}
