macro_rules! cfg_socket_impl {
    ($l:literal, { $($item:item)* }) => {
        $(
            #[cfg(feature = $l)]
            $item
        )*
    };
}

cfg_socket_impl!("std-socket", {
    mod std;
});
