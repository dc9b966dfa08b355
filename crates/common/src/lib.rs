// parlor-common: wire types shared between the gateway and its clients

pub mod protocol;
pub mod types;
