pub mod admin_config;
pub mod bind;
pub mod builder;
pub mod cache;
pub mod capability;
pub mod cgroups;
pub mod checkpoint;
pub mod confdir;
pub mod context;
pub mod crypt;
pub mod engine_config;
pub mod env;
pub mod error;
pub mod fakeroot;
pub mod gpu;
pub mod home;
pub mod image;
pub mod instance;
pub mod launcher;
pub mod mounts;
pub mod net;
pub mod overlay;
pub mod paths;
pub mod privilege;
pub mod pull;
pub mod remote;
pub mod security;
pub mod starter;
pub mod uri;
pub mod utils;
