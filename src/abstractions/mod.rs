/*!

Infrastructure that is independent of the collector itself.

*/

// Logging
pub mod log;
