mod config_tests;
mod mocks;
mod request_tests;
mod splitter_tests;
