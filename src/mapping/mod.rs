// Parameter reparametrization between estimation space and physical space
pub mod distribution;
pub mod mapper;

pub use distribution::{MapperType, ParameterDistribution, ParameterGroup};
pub use mapper::{OutOfBounds, ParameterMapper};
