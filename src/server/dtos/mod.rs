pub mod channel_dto;
pub mod epg_dto;
pub mod health_dto;
pub mod stream_dto;
