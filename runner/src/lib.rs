pub mod cluster;
pub mod config;
pub mod launcher;
pub mod ledger;
pub mod membership;
pub mod pool;
pub mod promise;
pub mod rpc;
pub mod scheduler;
pub mod task;
pub mod worker;

#[cfg(test)]
mod test_util;

#[cfg(test)]
mod cluster_test;
#[cfg(test)]
mod config_test;
#[cfg(test)]
mod launcher_test;
#[cfg(test)]
mod membership_test;
#[cfg(test)]
mod pool_test;
