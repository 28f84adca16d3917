pub mod daytona;
pub mod docker;
pub mod e2b;

pub use daytona::DaytonaProvider;
pub use docker::DockerProvider;
pub use e2b::E2bProvider;
