pub mod jingle;
pub mod jingle_dtls_srtp;
pub mod jingle_ice_udp;
pub mod jingle_message;
pub mod jingle_rtp;
pub mod jingle_ssma;
pub mod ns;
