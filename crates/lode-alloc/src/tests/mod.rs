//! Integration-style suites for the segment allocation core.

mod support;

mod lifecycle_tests;
