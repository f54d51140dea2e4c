pub mod output_wait_tests;
pub mod socket_tests;
