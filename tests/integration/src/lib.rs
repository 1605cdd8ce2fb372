//! End-to-end tests for the Keycloak storage core live under `tests/`.
