//! 鉴权 HTTP 接口处理模块。

mod http;

pub(crate) use http::{
    change_password_handler, login_handler, logout_handler, me_handler, refresh_handler,
    set_status_handler, signup_handler, validate_handler,
};
